//! Inventory rows and section-grouped host records.
//!
//! A row is `hostname [key=value|flag]*`, whitespace-delimited. The grammar is
//! deliberately permissive: anything that is not a well-formed `key=value`
//! token is kept as a bare flag, never rejected.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::error::InstallError;

/// Keys recognised as certificate-request attributes.
///
/// Presence of any of them (as `key=value` or bare flag) makes the host go
/// through the certificate-attribute provisioning step.
pub const CERT_ATTRIBUTE_NAMES: [&str; 25] = [
    "pp_uuid",
    "pp_instance_id",
    "pp_image_name",
    "pp_preshared_key",
    "pp_cost_center",
    "pp_product",
    "pp_project",
    "pp_application",
    "pp_service",
    "pp_employee",
    "pp_created_by",
    "pp_environment",
    "pp_role",
    "pp_software_version",
    "pp_department",
    "pp_cluster",
    "pp_provisioner",
    "pp_region",
    "pp_datacenter",
    "pp_zone",
    "pp_network",
    "pp_securitypolicy",
    "pp_cloudplatform",
    "pp_apptier",
    "pp_hostname",
];

/// Attribute that asks for code-deployment setup on a controller.
pub const DEPLOY_FLAG: &str = "deploy_code";

pub fn is_cert_attribute(key: &str) -> bool {
    CERT_ATTRIBUTE_NAMES.contains(&key)
}

/// Role of a section, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Controllers,
    Agents,
}

impl Role {
    pub fn from_section(name: &str) -> Option<Self> {
        match name {
            "controllers" => Some(Self::Controllers),
            "agents" => Some(Self::Agents),
            _ => None,
        }
    }

    pub fn section_name(self) -> &'static str {
        match self {
            Self::Controllers => "controllers",
            Self::Agents => "agents",
        }
    }
}

/// Value of a row attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Bare token without `=`.
    Flag,
    Value(String),
}

impl AttrValue {
    /// Text used when the attribute is rendered into a document.
    pub fn as_text(&self) -> &str {
        match self {
            Self::Flag => "true",
            Self::Value(value) => value,
        }
    }
}

/// One parsed inventory row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    /// Role of the enclosing section; `None` for rows parsed on their own or
    /// rows of sections without a known role.
    pub role: Option<Role>,
    pub hostname: String,
    pub attributes: BTreeMap<String, AttrValue>,
    pub needs_cert_attributes: bool,
}

impl InventoryRecord {
    pub fn has_deploy_flag(&self) -> bool {
        self.attributes.contains_key(DEPLOY_FLAG)
    }

    /// Registry attributes of this row, in key order.
    pub fn cert_attributes(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attributes
            .iter()
            .filter(|(key, _)| is_cert_attribute(key))
            .map(|(key, value)| (key.as_str(), value))
    }
}

/// Parse a single whitespace-delimited row.
///
/// Fails only when the row has no hostname (empty after trimming).
pub fn parse_row(line: &str) -> Result<InventoryRecord, InstallError> {
    let mut tokens = line.split_whitespace();
    let hostname = tokens.next().ok_or(InstallError::EmptyRow)?.to_string();

    let mut attributes = BTreeMap::new();
    let mut needs_cert_attributes = false;
    for token in tokens {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => (key, AttrValue::Value(value.to_string())),
            _ => (token, AttrValue::Flag),
        };
        if is_cert_attribute(key) {
            needs_cert_attributes = true;
        }
        attributes.insert(key.to_string(), value);
    }

    Ok(InventoryRecord {
        role: None,
        hostname,
        attributes,
        needs_cert_attributes,
    })
}

/// A named group of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub role: Option<Role>,
    pub records: Vec<InventoryRecord>,
}

/// Ordered set of sections, read-only once parsed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    sections: Vec<Section>,
}

impl Inventory {
    /// Parse INI-style inventory text.
    ///
    /// `[name]` opens a section (trimmed, lower-cased); blank lines and lines
    /// starting with `#` or `;` are skipped. A repeated header appends to the
    /// existing section.
    pub fn parse(text: &str) -> Result<Self> {
        let mut inventory = Self::default();
        let mut current: Option<usize> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let Some(name) = header.strip_suffix(']') else {
                    bail!("line {}: unterminated section header `{}`", idx + 1, line);
                };
                let name = name.trim().to_lowercase();
                if name.is_empty() {
                    bail!("line {}: empty section name", idx + 1);
                }
                current = Some(inventory.section_index_or_insert(&name));
                continue;
            }
            let Some(section_idx) = current else {
                bail!("line {}: row `{}` appears before any section", idx + 1, line);
            };
            let section = &mut inventory.sections[section_idx];
            let mut record = parse_row(line)?;
            record.role = section.role;
            section.records.push(record);
        }

        Ok(inventory)
    }

    fn section_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return idx;
        }
        self.sections.push(Section {
            name: name.to_string(),
            role: Role::from_section(name),
            records: Vec::new(),
        });
        self.sections.len() - 1
    }

    /// Section names in document order.
    pub fn sections(&self) -> Vec<&str> {
        self.sections.iter().map(|s| s.name.as_str()).collect()
    }

    /// Records of a section in document order.
    pub fn section(&self, name: &str) -> Result<&[InventoryRecord], InstallError> {
        let key = name.trim().to_lowercase();
        self.sections
            .iter()
            .find(|s| s.name == key)
            .map(|s| s.records.as_slice())
            .ok_or(InstallError::UnknownSection(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_is_first_token() {
        let record = parse_row("  web1.example.com   pp_role=web  ").expect("parse");
        assert_eq!(record.hostname, "web1.example.com");
        assert_eq!(record.attributes.len(), 1);
    }

    #[test]
    fn empty_rows_are_rejected() {
        assert!(matches!(parse_row(""), Err(InstallError::EmptyRow)));
        assert!(matches!(parse_row(" \t  "), Err(InstallError::EmptyRow)));
    }

    #[test]
    fn key_value_and_flag_tokens() {
        let record = parse_row("db1 region=eu-west deploy_code").expect("parse");
        assert_eq!(
            record.attributes.get("region"),
            Some(&AttrValue::Value("eu-west".to_string()))
        );
        assert_eq!(record.attributes.get("deploy_code"), Some(&AttrValue::Flag));
        assert!(record.has_deploy_flag());
        assert!(!record.needs_cert_attributes);
    }

    #[test]
    fn value_keeps_everything_after_first_equals() {
        let record = parse_row("h url=a=b key=").expect("parse");
        assert_eq!(
            record.attributes.get("url"),
            Some(&AttrValue::Value("a=b".to_string()))
        );
        assert_eq!(
            record.attributes.get("key"),
            Some(&AttrValue::Value(String::new()))
        );
    }

    #[test]
    fn malformed_tokens_become_flags() {
        let record = parse_row("h =orphan ==").expect("parse");
        assert_eq!(record.attributes.get("=orphan"), Some(&AttrValue::Flag));
        assert_eq!(record.attributes.get("=="), Some(&AttrValue::Flag));
    }

    #[test]
    fn last_occurrence_wins() {
        let record = parse_row("h tier=a tier=b").expect("parse");
        assert_eq!(
            record.attributes.get("tier"),
            Some(&AttrValue::Value("b".to_string()))
        );
    }

    #[test]
    fn every_registry_key_triggers_cert_attributes() {
        for key in CERT_ATTRIBUTE_NAMES {
            let as_value = parse_row(&format!("h {key}=x")).expect("parse");
            assert!(as_value.needs_cert_attributes, "{key}=x");
            let as_flag = parse_row(&format!("h {key}")).expect("parse");
            assert!(as_flag.needs_cert_attributes, "{key}");
        }
    }

    #[test]
    fn non_registry_keys_do_not_trigger_cert_attributes() {
        let record = parse_row("h role=web pp_unknown=1 deploy_code").expect("parse");
        assert!(!record.needs_cert_attributes);
        assert_eq!(record.cert_attributes().count(), 0);
    }

    #[test]
    fn parse_groups_rows_by_section_in_order() {
        let text = "\
# fleet
[Controllers]
master1 deploy_code

[agents]
web1 pp_role=web
; comment
web2
";
        let inventory = Inventory::parse(text).expect("parse");
        assert_eq!(inventory.sections(), vec!["controllers", "agents"]);

        let agents = inventory.section("agents").expect("agents");
        let hosts: Vec<&str> = agents.iter().map(|r| r.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["web1", "web2"]);
        assert_eq!(agents[0].role, Some(Role::Agents));

        let controllers = inventory.section("CONTROLLERS").expect("controllers");
        assert_eq!(controllers[0].role, Some(Role::Controllers));
    }

    #[test]
    fn unknown_section_is_an_error() {
        let inventory = Inventory::parse("[agents]\nweb1\n").expect("parse");
        let err = inventory.section("databases").unwrap_err();
        assert!(matches!(err, InstallError::UnknownSection(name) if name == "databases"));
    }

    #[test]
    fn repeated_header_appends_and_unknown_roles_are_kept() {
        let inventory =
            Inventory::parse("[agents]\na\n[databases]\ndb1\n[agents]\nb\n").expect("parse");
        assert_eq!(inventory.sections(), vec!["agents", "databases"]);
        assert_eq!(inventory.section("agents").expect("agents").len(), 2);
        let db = inventory.section("databases").expect("databases");
        assert_eq!(db[0].role, None);
    }

    #[test]
    fn rows_outside_sections_are_rejected() {
        let err = Inventory::parse("web1\n[agents]\n").unwrap_err();
        assert!(err.to_string().contains("before any section"));
    }
}
