//! Authentication: HBA access control and the SCRAM exchanges used on both
//! sides of the pooler.

pub mod hba;
pub mod scram;
pub mod scram_client;
