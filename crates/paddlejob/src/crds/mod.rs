pub mod paddlejob;

pub use paddlejob::*;
