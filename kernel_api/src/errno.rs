//! Error numbers returned in the error word of a system call

pub const EAGAIN: i32 = 11;
pub const EBADF: i32 = 9;
pub const EBADFD: i32 = 77;
pub const ECANCELED: i32 = 125;
pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const EMFILE: i32 = 24;
pub const ENFILE: i32 = 23;
pub const ENOBUFS: i32 = 105;
pub const ENOMEM: i32 = 12;
pub const ENOSYS: i32 = 38;
pub const EPROTO: i32 = 71;
