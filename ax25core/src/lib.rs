pub mod address;
pub mod frame;
pub mod kiss;
