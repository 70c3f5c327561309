use std::fmt;
use serde::{Deserialize, Serialize};
use crate::protocol::{EMPTY_TXT, HOSTNAME_WILDCARD};

/// A network service mirrored into the wide-area zone.
/// Produced by the mDNS feed or declared statically in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceRecord {
    /// Instance name, e.g. "Terminal Service"
    name: String,

    /// Service type, e.g. "_ssh._tcp"
    #[serde(rename = "type")]
    service_type: String,

    /// Optional subtype, e.g. "_printer"
    #[serde(default)]
    subtype: Option<String>,

    /// Host part of the SRV target; falls back to the publishing host
    #[serde(default)]
    hostname: Option<String>,

    /// Domain part of the SRV target; falls back to the zone
    #[serde(default)]
    domainname: Option<String>,

    /// Service port
    port: u16,

    /// TXT character-strings, usually "key=value"
    #[serde(default)]
    txt: Vec<String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, service_type: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            subtype: None,
            hostname: None,
            domainname: None,
            port,
            txt: Vec::new(),
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_domainname(mut self, domainname: impl Into<String>) -> Self {
        self.domainname = Some(domainname.into());
        self
    }

    pub fn with_txt<I, S>(mut self, txt: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.txt = txt.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the `%h` wildcard in the instance name with `hostname`
    pub fn with_expanded_name(mut self, hostname: &str) -> Self {
        self.name = self.name.replace(HOSTNAME_WILDCARD, hostname);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn subtype(&self) -> Option<&str> {
        self.subtype.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn domainname(&self) -> Option<&str> {
        self.domainname.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registry key: `subtype.type-port`, with the subtype part omitted when absent.
    /// Two records with the same key are the same published entity.
    pub fn identifier(&self) -> String {
        let mut key = String::new();
        if let Some(subtype) = &self.subtype {
            key.push_str(subtype);
            key.push('.');
        }
        if !self.service_type.is_empty() {
            key.push_str(&self.service_type);
            key.push('-');
        }
        key.push_str(&self.port.to_string());
        key
    }

    /// Subtype as browsers display it, e.g. "_ipp._tcp,_universal"
    pub fn subtype_display(&self) -> String {
        match &self.subtype {
            Some(subtype) => format!("{},{}", self.service_type, subtype),
            None => self.service_type.clone(),
        }
    }

    /// SRV target host: `hostname.domainname`, each part falling back to the given defaults
    pub fn target(&self, default_host: &str, default_zone: &str) -> String {
        format!(
            "{}.{}",
            self.hostname.as_deref().unwrap_or(default_host),
            self.domainname.as_deref().unwrap_or(default_zone),
        )
    }

    /// Owner name of the PTR record: the service type inside the zone
    pub fn type_in_zone(&self, zone: &str) -> String {
        format!("{}.{}", self.service_type, zone)
    }

    /// Owner name of the SRV and TXT records: the instance inside the zone.
    /// An unnamed service is published under the host's own name.
    pub fn instance_in_zone(&self, zone: &str, default_host: &str) -> String {
        let instance = if self.name.is_empty() { default_host } else { &self.name };
        format!("{}.{}.{}", instance, self.service_type, zone)
    }

    /// TXT payload. Never empty: a lone NUL string stands in for missing metadata.
    pub fn txt(&self) -> Vec<String> {
        let present: Vec<String> = self.txt.iter().filter(|s| !s.is_empty()).cloned().collect();
        if present.is_empty() {
            vec![EMPTY_TXT.to_string()]
        } else {
            present
        }
    }

    pub fn has_txt(&self) -> bool {
        self.txt.iter().any(|s| !s.is_empty())
    }
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.identifier())
    }
}
