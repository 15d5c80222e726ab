pub mod datagram_pool;
