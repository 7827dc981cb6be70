pub mod backend;

pub use backend::{etcd::EtcdBackend, Backend, KVPair, KVPairs};
