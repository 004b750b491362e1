//! Loading provisioning files into the authority.
//!
//! ```json
//! {
//!   "trusted_issuers": ["<base58 public key>"],
//!   "geofences": [
//!     { "merchant": "seed-shop-4", "latitude": -0.0917, "longitude": 34.768,
//!       "radius_m": 100.0, "mandatory": true }
//!   ],
//!   "wallets": [
//!     { "id": "<uuid>", "owner": "member-0042", "credit_limit": 50000 }
//!   ]
//! }
//! ```
//!
//! Applying a file twice is harmless: existing wallets are brought to the
//! listed limit and status, and fences and issuer keys are replaced.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use harvest_protocol::crypto::IssuerPublicKey;
use harvest_protocol::geo::{Coordinate, Geofence};
use harvest_protocol::ledger::WalletLedgerAuthority;
use harvest_protocol::transaction::{MerchantId, WalletId};
use harvest_protocol::wallet::WalletStatus;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisioningFile {
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    #[serde(default)]
    pub geofences: Vec<FenceSpec>,
    #[serde(default)]
    pub wallets: Vec<WalletSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FenceSpec {
    pub merchant: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalletSpec {
    /// Assigned by the co-op registry. A fresh id is generated when absent.
    pub id: Option<WalletId>,
    pub owner: String,
    pub credit_limit: u64,
    #[serde(default = "default_status")]
    pub status: WalletStatus,
}

fn default_true() -> bool {
    true
}

fn default_status() -> WalletStatus {
    WalletStatus::Active
}

/// What a provisioning run changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub issuers: usize,
    pub geofences: usize,
    pub wallets_created: Vec<WalletId>,
    pub wallets_updated: usize,
}

pub fn load(path: &Path) -> Result<ProvisioningFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read provisioning file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid provisioning file {}", path.display()))
}

pub fn apply(authority: &WalletLedgerAuthority, file: &ProvisioningFile) -> Result<ProvisionReport> {
    let mut report = ProvisionReport::default();

    for key in &file.trusted_issuers {
        let key = IssuerPublicKey::from_base58(key)
            .with_context(|| format!("invalid issuer key {key}"))?;
        authority.trust_issuer(key)?;
        report.issuers += 1;
    }

    for spec in &file.geofences {
        let center = Coordinate::new(spec.latitude, spec.longitude)
            .with_context(|| format!("geofence for {}", spec.merchant))?;
        let mut fence = Geofence::new(
            MerchantId::new(spec.merchant.clone()),
            center,
            spec.radius_m,
            spec.mandatory,
        )
        .with_context(|| format!("geofence for {}", spec.merchant))?;
        fence.active = spec.active;
        authority.register_geofence(fence)?;
        report.geofences += 1;
    }

    for spec in &file.wallets {
        let existing = match spec.id {
            Some(id) => authority.wallet(&id)?,
            None => None,
        };
        match existing {
            None => {
                let wallet = match spec.id {
                    Some(id) => authority.provision_wallet_with_id(id, &spec.owner, spec.credit_limit)?,
                    None => authority.provision_wallet(&spec.owner, spec.credit_limit)?,
                };
                apply_status(authority, &wallet.id, wallet.status, spec.status)?;
                report.wallets_created.push(wallet.id);
            }
            Some(wallet) => {
                if wallet.credit_limit != spec.credit_limit {
                    authority
                        .set_credit_limit(&wallet.id, spec.credit_limit)
                        .with_context(|| format!("wallet {}", wallet.id))?;
                }
                apply_status(authority, &wallet.id, wallet.status, spec.status)?;
                report.wallets_updated += 1;
            }
        }
    }

    Ok(report)
}

fn apply_status(
    authority: &WalletLedgerAuthority,
    id: &WalletId,
    current: WalletStatus,
    wanted: WalletStatus,
) -> Result<()> {
    match (current, wanted) {
        (a, b) if a == b => {}
        (_, WalletStatus::Closed) => {
            authority.close_wallet(id)?;
        }
        (WalletStatus::Active, WalletStatus::Suspended) => {
            authority.suspend_wallet(id)?;
        }
        (WalletStatus::Suspended, WalletStatus::Active) => {
            authority.reactivate_wallet(id)?;
        }
        (WalletStatus::Closed, other) => bail!("wallet {id} is closed and cannot become {other}"),
        (from, to) => bail!("wallet {id}: unsupported transition {from} -> {to}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_protocol::crypto::IssuerKeypair;

    fn parse(json: &str) -> ProvisioningFile {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn applies_a_full_file() {
        let auth = WalletLedgerAuthority::open_temporary().unwrap();
        let issuer = IssuerKeypair::generate().public_key();
        let id = WalletId::new();
        let file = parse(&format!(
            r#"{{
                "trusted_issuers": ["{}"],
                "geofences": [{{ "merchant": "stall-1", "latitude": 1.0, "longitude": 2.0,
                                 "radius_m": 50.0, "mandatory": true }}],
                "wallets": [
                    {{ "id": "{id}", "owner": "member-1", "credit_limit": 500 }},
                    {{ "owner": "member-2", "credit_limit": 300, "status": "suspended" }}
                ]
            }}"#,
            issuer.to_base58()
        ));
        let report = apply(&auth, &file).unwrap();
        assert_eq!(report.issuers, 1);
        assert_eq!(report.geofences, 1);
        assert_eq!(report.wallets_created.len(), 2);
        assert_eq!(report.wallets_created[0], id);

        let snap = auth.snapshot(&id).unwrap().unwrap();
        assert_eq!(snap.trusted_issuers, vec![issuer]);
        assert_eq!(snap.geofences.len(), 1);
        let second = auth.wallet(&report.wallets_created[1]).unwrap().unwrap();
        assert_eq!(second.status, WalletStatus::Suspended);
    }

    #[test]
    fn reapplying_updates_existing_wallets() {
        let auth = WalletLedgerAuthority::open_temporary().unwrap();
        let id = WalletId::new();
        let first = parse(&format!(
            r#"{{ "wallets": [{{ "id": "{id}", "owner": "m", "credit_limit": 100 }}] }}"#
        ));
        apply(&auth, &first).unwrap();
        let second = parse(&format!(
            r#"{{ "wallets": [{{ "id": "{id}", "owner": "m", "credit_limit": 250, "status": "closed" }}] }}"#
        ));
        let report = apply(&auth, &second).unwrap();
        assert_eq!(report.wallets_updated, 1);
        let w = auth.wallet(&id).unwrap().unwrap();
        assert_eq!(w.credit_limit, 250);
        assert_eq!(w.status, WalletStatus::Closed);

        let reopen = parse(&format!(
            r#"{{ "wallets": [{{ "id": "{id}", "owner": "m", "credit_limit": 250 }}] }}"#
        ));
        assert!(apply(&auth, &reopen).is_err());
    }

    #[test]
    fn rejects_bad_geometry_and_unknown_fields() {
        let auth = WalletLedgerAuthority::open_temporary().unwrap();
        let file = parse(
            r#"{ "geofences": [{ "merchant": "x", "latitude": 91.0, "longitude": 0.0, "radius_m": 10.0 }] }"#,
        );
        assert!(apply(&auth, &file).is_err());
        assert!(serde_json::from_str::<ProvisioningFile>(r#"{ "wallet": [] }"#).is_err());
    }
}
