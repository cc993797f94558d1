pub mod pooling;
