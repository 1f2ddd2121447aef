pub mod activation;
pub mod deeplab;
pub mod head;
pub mod pyramid;
pub mod spatial_pyramid;
pub mod utils;
