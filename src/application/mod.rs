//! Application services: identity resolution, generation contract and the
//! daily verse orchestrator.

pub mod daily_verse;
pub mod error;
pub mod generator;
pub mod identity;
