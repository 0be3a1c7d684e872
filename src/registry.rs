use dashmap::DashMap;
use ulid::Ulid;

use crate::model::ReferralLevel;

/// One level of a user's referral chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Referral {
    pub distributor_id: Ulid,
    pub level: ReferralLevel,
    /// Commission rate in basis points of the order amount.
    pub rate_bps: u32,
}

/// Read-only lookup boundary for the merchant/distributor registry. The
/// engine never writes through this seam.
pub trait Registry: Send + Sync {
    /// Distributors earning on this user's orders, direct level first.
    fn referral_chain(&self, user_id: Ulid) -> Vec<Referral>;

    /// The merchant operating this device, if any.
    fn merchant_for_device(&self, device_id: Ulid) -> Option<Ulid>;
}

/// In-memory registry for the daemon and tests.
pub struct StaticRegistry {
    chains: DashMap<Ulid, Vec<Referral>>,
    merchants: DashMap<Ulid, Ulid>,
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            merchants: DashMap::new(),
        }
    }

    pub fn set_chain(&self, user_id: Ulid, chain: Vec<Referral>) {
        self.chains.insert(user_id, chain);
    }

    pub fn set_merchant(&self, device_id: Ulid, merchant_id: Ulid) {
        self.merchants.insert(device_id, merchant_id);
    }
}

impl Registry for StaticRegistry {
    fn referral_chain(&self, user_id: Ulid) -> Vec<Referral> {
        self.chains
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    fn merchant_for_device(&self, device_id: Ulid) -> Option<Ulid> {
        self.merchants.get(&device_id).map(|e| *e.value())
    }
}
