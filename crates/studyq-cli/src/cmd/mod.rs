pub mod drain;
pub mod flush;
pub mod serve;
pub mod status;
