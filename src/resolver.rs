use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use rand::Rng;
use tokio::net::lookup_host;
use tracing::debug;

/// Selects one address out of the set a name resolves to. Implementations
///  must be safe under concurrent picks.
pub trait Balancer: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn pick(&self, host: &str, candidates: &[IpAddr]) -> Option<IpAddr>;
}

/// Uniform random selection.
pub struct RandomBalancer;

impl Balancer for RandomBalancer {
    fn name(&self) -> &str {
        "random"
    }

    fn pick(&self, _host: &str, candidates: &[IpAddr]) -> Option<IpAddr> {
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rand::thread_rng().gen_range(0..candidates.len())])
    }
}

/// Maps an address string to a concrete peer address. Accepts a literal
///  `host:port`, the bind forms `""` and `":port"`, and name-based forms
///  where the configured [`Balancer`] chooses among the resolved addresses.
pub struct Resolver {
    balancer: Arc<dyn Balancer>,
}

impl Resolver {
    pub fn new(balancer: Arc<dyn Balancer>) -> Resolver {
        Resolver { balancer }
    }

    pub async fn resolve(&self, addr: &str) -> anyhow::Result<SocketAddr> {
        if addr.is_empty() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        }

        if let Some(port) = addr.strip_prefix(':') {
            let port: u16 = port.parse().with_context(|| format!("invalid port in {:?}", addr))?;
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }

        if let Ok(socket_addr) = addr.parse::<SocketAddr>() {
            return Ok(socket_addr);
        }

        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("invalid address {:?}: expected host:port", addr))?;
        let port: u16 = port.parse().with_context(|| format!("invalid port in {:?}", addr))?;

        let candidates = lookup_host((host, port))
            .await
            .with_context(|| format!("DNS lookup failed for {:?}", host))?
            .map(|sa| sa.ip())
            .collect::<Vec<_>>();

        if candidates.is_empty() {
            bail!("DNS lookup for {:?} returned no addresses", host);
        }
        debug!("DNS lookup for {} returned {:?}", host, candidates);

        let chosen = self
            .balancer
            .pick(host, &candidates)
            .ok_or_else(|| anyhow!("balancer failed to select an address for {:?}", host))?;
        debug!("balancer {:?} selected {} -> {}:{}", self.balancer.name(), addr, chosen, port);

        Ok(SocketAddr::new(chosen, port))
    }
}

impl Default for Resolver {
    fn default() -> Resolver {
        Resolver::new(Arc::new(RandomBalancer))
    }
}
