use std::{future::Future, io, net::SocketAddr};

use tokio::net::lookup_host;

/// Server name resolution seam.
///
/// `alloc` resolves the configured domain exactly once; the resulting
/// candidates are filtered to the client's address family and the first
/// match becomes the server endpoint. An alternate-server redirect carries
/// a ready socket address and does not go through the resolver again.
pub trait Resolver: Send + 'static {
    fn resolve(
        &self,
        domain: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send;
}

/// System resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(
        &self,
        domain: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send {
        let target = format!("{}:{}", domain, port);
        async move { Ok(lookup_host(target).await?.collect()) }
    }
}

/// A fixed endpoint stands in for resolution when the server address is
/// already known.
impl Resolver for SocketAddr {
    fn resolve(
        &self,
        _: &str,
        _: u16,
    ) -> impl Future<Output = io::Result<Vec<SocketAddr>>> + Send {
        let addr = *self;
        async move { Ok(vec![addr]) }
    }
}
