pub mod calculate;
pub mod economics;
pub mod formula;
pub mod reconcile;
