pub mod conn;
pub mod dialer;
pub mod forwarder;
pub mod tls_acceptor;
