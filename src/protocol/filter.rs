//! Signal filters.
//!
//! A [`SignalFilter`] selects signals by sender, path, interface and member. Every
//! field is optional and an unset field matches anything, so the empty filter
//! matches every signal. The same filter renders to a bus match rule for
//! `org.freedesktop.DBus.AddMatch`.

use crate::core::message::{Message, MessageType};
use crate::core::names;
use crate::core::value::ObjectPath;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SignalFilter {
    sender: Option<String>,
    path: Option<ObjectPath>,
    interface: Option<String>,
    member: Option<String>,
}

impl SignalFilter {
    /// A filter matching every signal
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sender(mut self, sender: &str) -> Result<Self> {
        names::validate_bus_name(sender)?;
        self.sender = Some(sender.to_string());
        Ok(self)
    }

    pub fn path(mut self, path: &str) -> Result<Self> {
        self.path = Some(ObjectPath::new(path)?);
        Ok(self)
    }

    pub fn interface(mut self, interface: &str) -> Result<Self> {
        names::validate_interface_name(interface)?;
        self.interface = Some(interface.to_string());
        Ok(self)
    }

    pub fn member(mut self, member: &str) -> Result<Self> {
        names::validate_member_name(member)?;
        self.member = Some(member.to_string());
        Ok(self)
    }

    /// Exact match on every field that is set; non-signals never match
    pub fn matches(&self, msg: &Message) -> bool {
        if msg.message_type != MessageType::Signal {
            return false;
        }
        fn field_matches<T: PartialEq>(want: &Option<T>, got: &Option<T>) -> bool {
            want.as_ref().map_or(true, |w| got.as_ref() == Some(w))
        }
        field_matches(&self.sender, &msg.sender)
            && field_matches(&self.path, &msg.path)
            && field_matches(&self.interface, &msg.interface)
            && field_matches(&self.member, &msg.member)
    }

    /// Render as a bus match rule, e.g. `type='signal',interface='org.example.I'`
    pub fn to_match_rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        let mut push = |key: &str, value: &str| {
            rule.push_str(&format!(",{key}='{}'", value.replace('\'', "'\\''")));
        };
        if let Some(sender) = &self.sender {
            push("sender", sender);
        }
        if let Some(path) = &self.path {
            push("path", path.as_str());
        }
        if let Some(interface) = &self.interface {
            push("interface", interface);
        }
        if let Some(member) = &self.member {
            push("member", member);
        }
        rule
    }
}
