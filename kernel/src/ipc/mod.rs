//! Inter-process communication: the UNIX-domain socket layer.

pub mod unix;
