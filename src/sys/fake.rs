use std::{cell::RefCell, io};

use super::{SysResult, Syscall};

type SyscallFn = unsafe fn(Syscall<'_>) -> SysResult<i64>;

thread_local! {
    pub(crate) static TEST_SYSCALL: RefCell<SyscallFn> = RefCell::new(test_syscall);
}

unsafe fn test_syscall(_call: Syscall<'_>) -> SysResult<i64> {
    Err((-1, io::Error::from_raw_os_error(libc::EINVAL)))
}

pub(crate) fn override_syscall(call: unsafe fn(Syscall<'_>) -> SysResult<i64>) {
    TEST_SYSCALL.with(|test_impl| *test_impl.borrow_mut() = call);
}
