//! Reference data seam
//!
//! Participants, their per-currency position accounts and net debit caps are
//! owned outside the engine. The engine only reads them through
//! [`ReferenceData`]. [`StaticReferenceData`] is an in-process implementation
//! fed from configuration or built programmatically.

use crate::types::{Currency, ParticipantId};
use crate::{Error, Result};
use dashmap::{DashMap, DashSet};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Participant as seen by the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    /// Participant (FSP) name
    pub id: ParticipantId,

    /// Inactive participants may not send or receive
    pub active: bool,
}

/// Position account of a participant in one currency
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantAccount {
    /// Account enabled for this currency
    pub active: bool,

    /// Maximum negative net position (positive number)
    pub net_debit_cap: Decimal,
}

/// Read-only reference data consumed by the engine
pub trait ReferenceData: Send + Sync {
    /// Participant by id
    fn participant(&self, id: &ParticipantId) -> Option<Participant>;

    /// Position account of a participant in a currency
    fn account(&self, id: &ParticipantId, currency: &Currency) -> Option<ParticipantAccount>;

    /// Is the currency enabled on the hub at all
    fn is_currency_active(&self, currency: &Currency) -> bool;
}

/// `[[participants]]` config table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    /// Participant name
    pub name: String,

    /// Active flag
    #[serde(default = "default_true")]
    pub active: bool,

    /// Position accounts
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Per-currency account config entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// ISO 4217 code
    pub currency: String,

    /// Net debit cap
    pub net_debit_cap: Decimal,

    /// Active flag
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// In-memory reference data
#[derive(Debug, Default)]
pub struct StaticReferenceData {
    participants: DashMap<ParticipantId, bool>,
    accounts: DashMap<(ParticipantId, Currency), ParticipantAccount>,
    currencies: DashSet<Currency>,
}

impl StaticReferenceData {
    /// Empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `[[participants]]` config tables
    pub fn from_config(participants: &[ParticipantConfig]) -> Result<Self> {
        let data = Self::new();

        for participant in participants {
            let id = ParticipantId::new(participant.name.clone());
            data.participants.insert(id.clone(), participant.active);

            for account in &participant.accounts {
                let currency: Currency = account.currency.parse().map_err(|_| {
                    Error::Config(format!(
                        "Participant {} has invalid currency '{}'",
                        participant.name, account.currency
                    ))
                })?;
                data.currencies.insert(currency.clone());
                data.accounts.insert(
                    (id.clone(), currency),
                    ParticipantAccount {
                        active: account.active,
                        net_debit_cap: account.net_debit_cap,
                    },
                );
            }
        }

        Ok(data)
    }

    /// Add (or re-activate) a participant with one active account
    pub fn with_participant(
        self,
        id: impl Into<ParticipantId>,
        currency: &Currency,
        net_debit_cap: Decimal,
    ) -> Self {
        let id = id.into();
        self.participants.insert(id.clone(), true);
        self.currencies.insert(currency.clone());
        self.accounts.insert(
            (id, currency.clone()),
            ParticipantAccount {
                active: true,
                net_debit_cap,
            },
        );
        self
    }

    /// Change a participant's net debit cap
    pub fn set_net_debit_cap(&self, id: &ParticipantId, currency: &Currency, cap: Decimal) {
        if let Some(mut account) = self.accounts.get_mut(&(id.clone(), currency.clone())) {
            account.net_debit_cap = cap;
        }
    }

    /// Enable or disable a participant
    pub fn set_participant_active(&self, id: &ParticipantId, active: bool) {
        self.participants.insert(id.clone(), active);
    }

    /// Enable or disable one participant account
    pub fn set_account_active(&self, id: &ParticipantId, currency: &Currency, active: bool) {
        if let Some(mut account) = self.accounts.get_mut(&(id.clone(), currency.clone())) {
            account.active = active;
        }
    }
}

impl ReferenceData for StaticReferenceData {
    fn participant(&self, id: &ParticipantId) -> Option<Participant> {
        self.participants.get(id).map(|active| Participant {
            id: id.clone(),
            active: *active,
        })
    }

    fn account(&self, id: &ParticipantId, currency: &Currency) -> Option<ParticipantAccount> {
        self.accounts
            .get(&(id.clone(), currency.clone()))
            .map(|account| account.clone())
    }

    fn is_currency_active(&self, currency: &Currency) -> bool {
        self.currencies.contains(currency)
    }
}
