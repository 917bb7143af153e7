//! Small FTP, SMTP, DNS and HTTP client utilities, plus the local FTP and
//! SMTP servers they are exercised against.
//!
//! The FTP transfer controller and the SMTP dispatch controller are the
//! core. Each client binary builds one [`utils::Logger`], runs one
//! controller and reports one terminal [`report::Outcome`].

pub mod cli;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod ftp;
pub mod http;
pub mod report;
pub mod smtp;
pub mod tls;
pub mod utils;

pub use crate::endpoint::{Credentials, Endpoint};
pub use crate::error::{NetError, Result};
