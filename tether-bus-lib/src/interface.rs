use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tether_bus_common::{
    config::{InterfaceConfig, MemberConfig},
    match_rule, Result, SIGNAL_RULE_TYPE,
};

use crate::message::Message;

/// Signal callback
pub type Callback = Arc<dyn Fn(&mut Message) -> Result<()> + Send + Sync>;

static NEXT_MEMBER_ID: AtomicU64 = AtomicU64::new(1);

/// Member identity. Members are removed by identity, names are not unique
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId(u64);

impl MemberId {
    fn next() -> Self {
        Self(NEXT_MEMBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Signal subscriber
pub struct Member {
    id: MemberId,
    name: String,
    owner: Option<String>,
    callback: Callback,
}

impl Member {
    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribing party
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn callback(&self) -> Callback {
        self.callback.clone()
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Bus interface with its signal subscribers
#[derive(Debug)]
pub struct Interface {
    name: String,
    kind: &'static str,
    members: Vec<Member>,
}

impl Interface {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            kind: SIGNAL_RULE_TYPE,
            members: Vec::new(),
        }
    }

    /// Interface named by a configuration entry. Members are bound with [Interface::push_config]
    pub fn from_config(config: &InterfaceConfig) -> Self {
        Self::new(&config.interface)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match rule type tag
    pub fn kind(&self) -> &str {
        self.kind
    }

    /// Bus match rule delivering this interface signals
    pub fn rule(&self) -> String {
        match_rule(self.kind, &self.name)
    }

    pub fn push_config<F>(&mut self, config: &MemberConfig, callback: F) -> MemberId
    where
        F: Fn(&mut Message) -> Result<()> + Send + Sync + 'static,
    {
        self.emplace_back(&config.member, callback)
    }

    pub fn emplace_back<F>(&mut self, member: &str, callback: F) -> MemberId
    where
        F: Fn(&mut Message) -> Result<()> + Send + Sync + 'static,
    {
        self.push_member(member, None, Arc::new(callback))
    }

    pub(crate) fn push_member(
        &mut self,
        member: &str,
        owner: Option<&str>,
        callback: Callback,
    ) -> MemberId {
        let id = MemberId::next();

        self.members.push(Member {
            id,
            name: member.into(),
            owner: owner.map(Into::into),
            callback,
        });

        id
    }

    /// Remove a member. Returns `false` if there is no member with the `id`
    pub fn remove(&mut self, id: MemberId) -> bool {
        let count = self.members.len();
        self.members.retain(|member| member.id != id);

        count != self.members.len()
    }

    /// Remove all members of the `owner`. Returns number of removed members
    pub fn remove_owner(&mut self, owner: &str) -> usize {
        let count = self.members.len();
        self.members
            .retain(|member| member.owner.as_deref() != Some(owner));

        count - self.members.len()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Members subscribed to `member` signal, in registration order
    pub fn matching<'a>(&'a self, member: &'a str) -> impl Iterator<Item = &'a Member> + 'a {
        self.members.iter().filter(move |m| m.name == member)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.members.iter().any(|member| member.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}

impl PartialEq<str> for Interface {
    fn eq(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

impl PartialEq<&str> for Interface {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}
