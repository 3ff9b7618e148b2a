//! Infrastructure: persistence, events and the external collaborators the
//! services talk to.

pub mod event;
pub mod ledger;
pub mod remote;
pub mod store;
pub mod transport;
