use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// The group proxies advertise on unless told otherwise.
pub const DEFAULT_ADVERTISE_GROUP: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 1, 105)), 23364);

pub const DEFAULT_ADVERTISE_FREQUENCY: Duration = if cfg!(test) {
    Duration::from_millis(100)
} else {
    Duration::from_secs(10)
};

const GROUP_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A proxy announcing where its manager can be reached.
pub struct Advertisement {
    pub group: SocketAddr,
    pub server_addr: SocketAddr,
    pub server_name: String,
    pub sequence: u64,
    /// Present when the proxy shares a security key with its listeners.
    pub digest: Option<u32>,
}

impl Advertisement {
    /// Checks the advertisement was produced with the given security key.
    ///
    /// Without a key every advertisement is accepted.
    pub fn verify(&self, key: Option<&str>) -> bool {
        match key {
            None => true,
            Some(key) => {
                self.digest == Some(digest(key, self.sequence, &self.server_name))
            },
        }
    }
}

/// The digest of an advertisement signed with `key`.
pub fn digest(key: &str, sequence: u64, server_name: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(key.as_bytes());
    hasher.update(sequence.to_string().as_bytes());
    hasher.update(server_name.as_bytes());
    hasher.finalize()
}

#[derive(Clone)]
/// An in-process advertisement channel identified by its group address.
///
/// Every clone shares the same channel, subscribers only receive
/// advertisements published after they subscribed.
pub struct AdvertiseGroup {
    addr: SocketAddr,
    tx: broadcast::Sender<Advertisement>,
}

impl AdvertiseGroup {
    pub fn new(addr: SocketAddr) -> Self {
        let (tx, _) = broadcast::channel(GROUP_CAPACITY);
        Self { addr, tx }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Publishes an advertisement, returning the number of subscribers
    /// which will see it.
    pub fn publish(&self, advertisement: Advertisement) -> usize {
        self.tx.send(advertisement).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Advertisement> {
        self.tx.subscribe()
    }
}

impl Default for AdvertiseGroup {
    fn default() -> Self {
        Self::new(DEFAULT_ADVERTISE_GROUP)
    }
}

/// Periodically announces a proxy on its group.
pub(crate) struct Advertiser {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Advertiser {
    pub(crate) fn spawn(
        group: AdvertiseGroup,
        server_addr: SocketAddr,
        server_name: String,
        security_key: Option<String>,
        frequency: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut interval = interval(frequency);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            let mut sequence = 0;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {},
                }

                sequence += 1;
                let digest = security_key
                    .as_deref()
                    .map(|key| digest(key, sequence, &server_name));
                let num_receivers = group.publish(Advertisement {
                    group: group.addr(),
                    server_addr,
                    server_name: server_name.clone(),
                    sequence,
                    digest,
                });

                trace!(
                    group = %group.addr(),
                    server_addr = %server_addr,
                    sequence = sequence,
                    num_receivers = num_receivers,
                    "Published advertisement."
                );
            }
        });

        Self { shutdown, handle }
    }

    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_verification() {
        let server_addr = "127.0.0.1:6666".parse().unwrap();
        let advertisement = Advertisement {
            group: DEFAULT_ADVERTISE_GROUP,
            server_addr,
            server_name: "proxy".to_string(),
            sequence: 3,
            digest: Some(digest("secret", 3, "proxy")),
        };

        assert!(advertisement.verify(Some("secret")));
        assert!(advertisement.verify(None));
        assert!(!advertisement.verify(Some("other")));

        let unsigned = Advertisement {
            digest: None,
            ..advertisement
        };
        assert!(!unsigned.verify(Some("secret")));
    }

    #[tokio::test]
    async fn test_advertiser_publishes() {
        let group = AdvertiseGroup::default();
        let mut rx = group.subscribe();

        let server_addr = "127.0.0.1:6666".parse().unwrap();
        let advertiser = Advertiser::spawn(
            group.clone(),
            server_addr,
            "proxy".to_string(),
            Some("secret".to_string()),
            Duration::from_millis(10),
        );

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        advertiser.stop().await;

        assert_eq!(first.server_addr, server_addr);
        assert_eq!(first.group, DEFAULT_ADVERTISE_GROUP);
        assert_eq!(second.sequence, first.sequence + 1);
        assert!(second.verify(Some("secret")));
    }
}
