use arrayvec::ArrayVec;
use log::warn;

use crate::addr::Address;

/// A connection attempt carries at most public, private, direct and one spare.
pub const MAX_CANDIDATES: usize = 4;

/// One named address candidate for the current connection attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    alias: String,
    raw: String,
    resolved: Option<Address>,
}

impl Candidate {
    pub fn alias(&self) -> &str { &self.alias }
    pub fn raw(&self) -> &str { &self.raw }
    /// `None` when name resolution failed; such entries are kept in the
    /// list but skipped when composing packets.
    pub fn address(&self) -> Option<Address> { self.resolved }
}

/// Ordered, de-duplicated set of address candidates a connection attempt
/// may try. Answers "is this inbound address one I am expecting a reply
/// from" queries for the connect-packet builder.
#[derive(Debug, Default)]
pub struct AddressList {
    list: ArrayVec<[Candidate; MAX_CANDIDATES]>,
}

impl AddressList {
    pub fn new() -> Self {
        Self { list: ArrayVec::new() }
    }

    /// Appends a candidate unless an entry with identical raw text (any
    /// casing) already exists. Resolution happens eagerly; failure is
    /// recorded on the entry, never surfaced.
    pub fn add_remote(&mut self, raw: &str, alias: &str) {
        if raw.trim().is_empty() || self.is_remote_in_list(raw) {
            return;
        }
        let resolved = Address::resolve(raw);
        if resolved.is_none() {
            warn!("bad server address {}({})", alias, raw);
        }
        let candidate = Candidate {
            alias: alias.to_owned(),
            raw: raw.to_owned(),
            resolved,
        };
        if self.list.try_push(candidate).is_err() {
            warn!("address list full, dropping {}({})", alias, raw);
        }
    }

    pub fn is_remote_in_list(&self, raw: &str) -> bool {
        self.list.iter().any(|c| c.raw.eq_ignore_ascii_case(raw))
    }

    pub fn is_address_in_list(&self, addr: Address) -> bool {
        self.list
            .iter()
            .any(|c| c.resolved.map_or(false, |r| r.matches(&addr)))
    }

    /// Clears for a fresh attempt.
    pub fn remove_all(&mut self) {
        self.list.clear();
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.list.iter()
    }

    /// Candidates that resolved, in insertion order.
    pub fn resolved(&self) -> impl Iterator<Item = Address> + '_ {
        self.list.iter().filter_map(|c| c.resolved)
    }

    /// `alias(address)` pairs for the connect log line.
    pub fn describe(&self) -> String {
        let mut s = String::new();
        for c in &self.list {
            match c.resolved {
                Some(addr) => s.push_str(&format!("{}({}) ", c.alias, addr)),
                None => s.push_str(&format!("{}(unresolved) ", c.alias)),
            }
        }
        s
    }
}
