//! `galera-balancer`: a TCP connection balancer for Galera-style clusters.
//!
//! Module layout mirrors the subsystems a running instance needs: a policy
//! engine (`router`), a connection pool of independent reactors (`pool`), a
//! blocking accept loop (`listener`), a health-check supervisor
//! (`watchdog`), a line-protocol control plane (`control`), configuration
//! loading (`config`), the shutdown signal (`signal`) and the process
//! wiring that assembles all of the above (`app`).

#[macro_use]
extern crate log;
extern crate libc;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate serde_yaml;
extern crate tokio_core;
extern crate tokio_io;
extern crate futures;

pub mod addr;
pub mod error;
pub mod router;
pub mod pool;
pub mod listener;
pub mod watchdog;
pub mod control;
pub mod config;
pub mod signal;
pub mod app;

pub use addr::Destination;
pub use error::{Error, Result};
