//! Infrastructure layer - store backends

pub mod storage;
