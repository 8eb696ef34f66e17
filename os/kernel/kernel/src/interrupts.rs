//! # Interrupt handlers with memory side effects
//!
//! - [`page_fault`]: classify a fault into one of four causes and resolve
//!   the recoverable ones.
//! - [`timer`]: the global tick counter.

pub mod page_fault;
pub mod timer;
