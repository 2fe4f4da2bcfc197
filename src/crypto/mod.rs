pub mod ecdsa;
pub mod hybrid;
