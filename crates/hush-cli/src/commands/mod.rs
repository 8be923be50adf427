pub mod demo;
pub mod queues;
