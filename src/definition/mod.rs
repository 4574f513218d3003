use indexmap::IndexMap;
use thiserror::Error;

pub(crate) mod codec;

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("line {line}: {message} (`{content}`)")]
    Parse {
        line: usize,
        content: String,
        message: String,
    },
    #[error("invalid tunnel definition: {0}")]
    Validation(String),
    #[error("io error: {1}")]
    Io(std::io::Error, String),
}
impl From<std::io::Error> for DefinitionError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}

/// Options of one host, in the order they were written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct HostSpec {
    options: IndexMap<String, String>,
}
impl HostSpec {
    pub const KEY_OPTION: &'static str = "key";

    #[cfg(test)]
    pub fn get(&self, option: &str) -> Option<&str> {
        self.options.get(option).map(String::as_str)
    }
    /// private key material, with its line breaks
    #[cfg(test)]
    pub fn key(&self) -> Option<&str> {
        self.get(Self::KEY_OPTION)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HostSpec {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        HostSpec {
            options: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForwardRule {
    pub from: String,
    pub to: String,
}
impl ForwardRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        ForwardRule {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A loaded tunnel definition. There is no way to change one after it has been
/// built: edits go through the text format and a fresh decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TunnelDefinition {
    /// file name without the `.ini` extension
    name: String,
    description: String,
    /// the host ssh connects to first
    main: Option<String>,
    hosts: IndexMap<String, HostSpec>,
    /// forward groups, rule order inside a group is significant
    forwards: IndexMap<String, Vec<ForwardRule>>,
}

impl TunnelDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        main: Option<String>,
        hosts: IndexMap<String, HostSpec>,
        forwards: IndexMap<String, Vec<ForwardRule>>,
    ) -> Result<TunnelDefinition, DefinitionError> {
        let definition = TunnelDefinition {
            name: name.into(),
            description: description.into(),
            main,
            hosts,
            forwards,
        };
        definition.validate()?;
        Ok(definition)
    }
    fn validate(&self) -> Result<(), DefinitionError> {
        if let Some(main) = &self.main {
            if !self.hosts.contains_key(main) {
                return Err(DefinitionError::Validation(format!(
                    "main host {main:?} is not defined in any [host ...] section"
                )));
            }
        }
        // only a host key may span lines, everything else is written on one
        single_line("description", &self.description)?;
        for (id, host) in &self.hosts {
            single_line("host id", id)?;
            for (option, value) in host.iter() {
                single_line("host option", option)?;
                if option != HostSpec::KEY_OPTION {
                    single_line(option, value)?;
                }
            }
        }
        for (group, rules) in &self.forwards {
            single_line("forward group", group)?;
            for rule in rules {
                single_line("forward source", &rule.from)?;
                single_line(&rule.from, &rule.to)?;
            }
        }
        Ok(())
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn description(&self) -> &str {
        &self.description
    }
    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }
    pub fn hosts(&self) -> &IndexMap<String, HostSpec> {
        &self.hosts
    }
    pub fn forwards(&self) -> &IndexMap<String, Vec<ForwardRule>> {
        &self.forwards
    }
}

fn single_line(field: &str, value: &str) -> Result<(), DefinitionError> {
    if value.contains(['\n', '\r']) {
        return Err(DefinitionError::Validation(format!(
            "{field} {value:?} contains a line break"
        )));
    }
    Ok(())
}
