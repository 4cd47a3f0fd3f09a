//! Franklin Serial Port Detection Library
//!
//! This crate provides serial port enumeration, port blacklisting and the
//! identify handshake used to find out which device (if any) sits behind a
//! freshly attached serial port.
//!
//! # Example
//!
//! ```rust,no_run
//! use franklin_detect::{PortFilter, PortScanner};
//!
//! let filter = PortFilter::with_defaults::<&str>(&[]).unwrap();
//! let ports = PortScanner::new().enumerate_ports().unwrap();
//!
//! for port in ports.iter().filter(|p| !filter.is_blacklisted(p)) {
//!     println!("Found port: {}", port);
//! }
//! ```

pub mod blacklist;
pub mod error;
pub mod handshake;
pub mod scanner;

pub use blacklist::{PortFilter, DEFAULT_BLACKLIST};
pub use error::DetectError;
pub use handshake::{
    is_synthetic_port, needs_warmup, open_link, HandshakeConfig, Identification, Identifier,
    DEFAULT_BAUD_RATE,
};
pub use scanner::PortScanner;
