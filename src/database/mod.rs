mod redis;

pub use self::redis::RedisPool;
