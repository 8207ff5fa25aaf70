//! Deterministic resource naming.
//!
//! Every resource this crate creates is namespaced by an *envcl*: the environment's initial, the
//! server group, and the server type, joined by dashes (e.g. `s-video-mongo`). Instance names then
//! append a location code and, usually, the lowest two-digit index not already taken by a running
//! instance with the same prefix.

use crate::error::ValidationError;
use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The deployment environment a server belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Test,
    Stage,
    Prod,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Test
    }
}

impl Environment {
    /// The single-letter prefix used in envcl names.
    pub fn initial(self) -> char {
        match self {
            Environment::Test => 't',
            Environment::Stage => 's',
            Environment::Prod => 'p',
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Test => "test",
            Environment::Stage => "stage",
            Environment::Prod => "prod",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match &*s.to_lowercase() {
            "test" => Environment::Test,
            "stage" => Environment::Stage,
            "prod" => Environment::Prod,
            _ => return Err(ValidationError::UnknownEnvironment(s.to_string()).into()),
        })
    }
}

/// How instance names are built for a workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameTemplate {
    /// The final name, e.g. `{envcl}-{location}-{index}`.
    pub template: String,
    /// Prefix used to find running siblings when allocating `{index}`.
    pub search_prefix: String,
    /// Whether `{index}` should be allocated at all.
    pub auto_index: bool,
}

impl Default for NameTemplate {
    fn default() -> Self {
        NameTemplate {
            template: "{envcl}-{location}-{index}".into(),
            search_prefix: "{envcl}-{location}-".into(),
            auto_index: true,
        }
    }
}

/// Substitute `{key}` placeholders in `template` with values from `fields`.
///
/// `{{` and `}}` produce literal braces. A placeholder with no matching field is an error rather
/// than being left in place, since a half-rendered name would be silently wrong.
pub fn render(template: &str, fields: &HashMap<&str, String>) -> Result<String, Report> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => eyre::bail!("unterminated placeholder in template {:?}", template),
                    }
                }
                let value = fields
                    .get(&*key)
                    .ok_or_else(|| eyre::eyre!("unknown field {{{}}} in template {:?}", key, template))?;
                out.push_str(value);
            }
            '}' => eyre::bail!("unmatched '}}' in template {:?}", template),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Build the `{environment}-{group}-{server type}` namespacing key.
pub fn envcl(environment: Environment, group: &str, server_type: &str) -> String {
    format!("{}-{}-{}", environment.initial(), group, server_type)
}

fn region_code(region: &str) -> Option<&'static str> {
    Some(match region {
        "ap-northeast-1" => "apne1",
        "ap-northeast-2" => "apne2",
        "ap-south-1" => "aps1",
        "ap-southeast-1" => "apse1",
        "ap-southeast-2" => "apse2",
        "ca-central-1" => "cac1",
        "eu-central-1" => "euc1",
        "eu-west-1" => "euw1",
        "eu-west-2" => "euw2",
        "eu-west-3" => "euw3",
        "eu-north-1" => "eun1",
        "sa-east-1" => "sae1",
        "us-east-1" => "use1",
        "us-east-2" => "use2",
        "us-west-1" => "usw1",
        "us-west-2" => "usw2",
        _ => return None,
    })
}

/// The short location code for a region and availability zone, e.g. `use1c`.
pub fn location(region: &str, availability_zone: &str) -> Result<String, Report> {
    let code = region_code(region)
        .ok_or_else(|| Report::new(ValidationError::InvalidRegion(region.to_string())))?;
    let zone = availability_zone
        .chars()
        .last()
        .ok_or_else(|| eyre::eyre!("empty availability zone"))?;
    Ok(format!("{}{}", code, zone))
}

/// Expand a bare zone letter (`c`) into a full availability zone name (`us-east-1c`).
pub fn qualify_zone(region: &str, zone: &str) -> String {
    if zone.len() == 1 {
        format!("{}{}", region, zone)
    } else {
        zone.to_string()
    }
}

/// The lowest index in `1..=99` not used as a numeric suffix by any of `names`.
///
/// The suffix is whatever follows the last `-`; names whose suffix is not all digits do not
/// occupy an index.
pub fn first_free_index<'a, I>(prefix: &str, names: I) -> Result<u8, Report>
where
    I: IntoIterator<Item = &'a str>,
{
    let taken: BTreeSet<u32> = names
        .into_iter()
        .filter_map(|name| name.rsplit('-').next())
        .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse().ok())
        .collect();

    (1..=99u8)
        .find(|i| !taken.contains(&u32::from(*i)))
        .ok_or_else(|| ValidationError::IndexesExhausted(prefix.to_string()).into())
}

pub fn format_index(index: u8) -> String {
    format!("{:02}", index)
}

/// The fully-qualified hostname for `name` in `domain`.
pub fn hostname(name: &str, domain: &str) -> String {
    format!("{}.{}", name, domain.trim_start_matches('.'))
}

/// Upper-case the first character and lower-case the rest, as in `RoleMongo`.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fields(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn envcl_uses_environment_initial() {
        assert_eq!(envcl(Environment::Stage, "video", "mongo"), "s-video-mongo");
        assert_eq!(envcl(Environment::Prod, "web", "nginx"), "p-web-nginx");
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!("Stage".parse::<Environment>().unwrap(), Environment::Stage);
        let err = "qa".parse::<Environment>().unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::UnknownEnvironment("qa".into()))
        );
    }

    #[test]
    fn render_substitutes_and_escapes() {
        let f = fields(&[("envcl", "t-g-mongo"), ("location", "use1c"), ("index", "03")]);
        assert_eq!(
            render("{envcl}-{location}-{index}", &f).unwrap(),
            "t-g-mongo-use1c-03"
        );
        assert_eq!(render("{{literal}}", &f).unwrap(), "{literal}");
        assert!(render("{missing}", &f).is_err());
        assert!(render("{envcl", &f).is_err());
    }

    #[test]
    fn location_codes() {
        assert_eq!(location("us-east-1", "us-east-1c").unwrap(), "use1c");
        assert_eq!(location("eu-west-1", "eu-west-1a").unwrap(), "euw1a");
        let err = location("mars-north-1", "mars-north-1a").unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[test]
    fn zone_letters_are_qualified() {
        assert_eq!(qualify_zone("us-east-1", "c"), "us-east-1c");
        assert_eq!(qualify_zone("us-east-1", "us-east-1d"), "us-east-1d");
    }

    #[test]
    fn index_is_lowest_free() {
        let p = "t-g-mongo-use1c-";
        assert_eq!(first_free_index(p, vec![]).unwrap(), 1);
        assert_eq!(
            first_free_index(p, vec!["t-g-mongo-use1c-01", "t-g-mongo-use1c-02"]).unwrap(),
            3
        );
        assert_eq!(
            first_free_index(p, vec!["t-g-mongo-use1c-02", "t-g-mongo-use1c-04"]).unwrap(),
            1
        );
        assert_eq!(
            first_free_index(p, vec!["t-g-mongo-use1c-01", "t-g-mongo-use1c-arb"]).unwrap(),
            2
        );
    }

    #[test]
    fn index_exhaustion_is_an_error() {
        let names: Vec<String> = (1..=99).map(|i| format!("x-{:02}", i)).collect();
        let err = first_free_index("x-", names.iter().map(String::as_str)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValidationError>(),
            Some(&ValidationError::IndexesExhausted("x-".into()))
        );
    }

    #[test]
    fn index_is_zero_padded() {
        assert_eq!(format_index(7), "07");
        assert_eq!(format_index(42), "42");
    }

    #[test]
    fn capitalize_role_names() {
        assert_eq!(capitalize("mongo"), "Mongo");
        assert_eq!(capitalize("rABBIT"), "Rabbit");
        assert_eq!(capitalize(""), "");
    }
}
