//! Library to back up and restore an [Odoo][odoo] installation with [Kopia][kopia].
//!
//! A backup dumps the PostgreSQL database into the Odoo data directory, binds
//! the dump to a checksum and snapshots the whole directory into a Kopia
//! repository. Restores go the opposite way over a read-only connection.
//! The external tools are wrapped in the [`backends`] module, the runs
//! themselves are sequenced in [`orchestrator`].
//!
//! [odoo]: https://www.odoo.com/
//! [kopia]: https://kopia.io/

#![forbid(unsafe_code)]

pub mod backends;
pub mod cli;
pub mod config;
pub mod error;
pub mod kube;
pub mod odoo;
pub mod orchestrator;
pub mod util;
