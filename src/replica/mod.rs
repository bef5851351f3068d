pub mod controller;
pub mod proto;
pub mod request;
pub mod worker;
