use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha512};

const CHAIN_PREFIX: &str = "CNI-";
const CHAIN_HASH_LEN: usize = 24;

/// Request-scoped source of random interface names. Seeded once per request
/// so a given seed always yields the same sequence.
pub struct NameGen {
    rng: StdRng,
}

impl NameGen {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self::from_seed(rand::rng().random())
    }

    /// `<prefix>` followed by 8 hex digits
    pub fn next(&mut self, prefix: &str) -> String {
        random_name(&mut self.rng, prefix)
    }
}

/// Name built from one draw of `rng`: host veth ends use prefix `veth`.
pub fn random_name<R: Rng>(rng: &mut R, prefix: &str) -> String {
    format!("{}{:08x}", prefix, rng.random::<u32>())
}

/// iptables chain owned by one (network, container) attachment
pub fn chain_name(network: &str, container_id: &str) -> String {
    let digest = Sha512::digest(format!("{}{}", network, container_id).as_bytes());
    let hash = hex::encode(digest);
    format!("{}{}", CHAIN_PREFIX, &hash[..CHAIN_HASH_LEN])
}

/// Rule comment tying masquerade rules to their owner
pub fn chain_comment(network: &str, container_id: &str) -> String {
    format!("name: {:?} id: {:?}", network, container_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_names() {
        let mut a = NameGen::from_seed(42);
        let mut b = NameGen::from_seed(42);
        let first = a.next("veth");
        assert_eq!(first, b.next("veth"));
        assert_eq!(a.next("veth"), b.next("veth"));
        assert_ne!(first, a.next("veth"));
    }

    #[test]
    fn name_shape() {
        let name = NameGen::from_seed(7).next("veth");
        assert_eq!(name.len(), 12);
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
        // fits IFNAMSIZ with room to spare
        assert!(name.len() < 16);
    }

    #[test]
    fn chain_is_stable_and_bounded() {
        let chain = chain_name("village", "c1");
        assert_eq!(chain, chain_name("village", "c1"));
        assert_ne!(chain, chain_name("village", "c2"));
        assert!(chain.starts_with("CNI-"));
        // iptables chain names max out at 28 chars
        assert_eq!(chain.len(), 28);
    }

    #[test]
    fn comment_quotes_both_parts() {
        assert_eq!(
            chain_comment("village", "c1"),
            "name: \"village\" id: \"c1\""
        );
    }
}
