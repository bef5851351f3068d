pub mod chunker;
pub mod htm;
pub mod sphere;
