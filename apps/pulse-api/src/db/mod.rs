pub mod entity;
pub mod kv;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod redis;
pub mod schema;
