//! Integration test code.
//!
//! These run the host side against a stand-in sandbox launcher: a shell
//! script written into a temporary directory, which records how it was
//! started and then sleeps until it is killed.

mod grains;
pub(crate) mod util;
