pub mod state;
pub mod storage;
