use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::AddressingError;

/// Separator between the modules of a chain (`root->child->leaf`).
pub const CHAIN_SEPARATOR: &str = "->";
/// Separator between a module path and its instance id (`module:3`).
pub const INSTANCE_SEPARATOR: char = ':';

/// Identity of one module instance at one position of a `RequestPath`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId {
    pub module_path: String,
    pub instance_id: u32,
}

impl ModuleId {
    pub fn new(module_path: impl Into<String>, instance_id: u32) -> Self {
        Self {
            module_path: module_path.into(),
            instance_id,
        }
    }

    /// Parses `module` or `module:instance`. `position` is only used for error reporting.
    pub fn parse_at(text: &str, position: usize) -> Result<Self, AddressingError> {
        let text = text.trim();
        let (module, instance) = match text.rsplit_once(INSTANCE_SEPARATOR) {
            Some((module, instance)) => (module.trim(), Some(instance.trim())),
            None => (text, None),
        };
        validate_module_path(module, position)?;
        let instance_id = match instance {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| AddressingError::InvalidInstanceId {
                    module: module.to_string(),
                    text: raw.to_string(),
                })?,
            None => 0,
        };
        Ok(Self::new(module, instance_id))
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.module_path, INSTANCE_SEPARATOR, self.instance_id)
    }
}

pub(crate) fn validate_module_path(module: &str, position: usize) -> Result<(), AddressingError> {
    if module.is_empty() || module.contains(CHAIN_SEPARATOR) || module.contains(INSTANCE_SEPARATOR)
    {
        return Err(AddressingError::EmptyModule { position });
    }
    Ok(())
}

/// Ancestry chain of module instances, root first.
///
/// A path is never empty and never mutated in place: `augment` and `sub_path`
/// return new paths. The unique form (`a:0->b:1`) identifies exactly one live
/// module instance; the type form (`a->b`) ignores instance ids and is the key
/// used for instance id allocation.
///
/// # Examples
///
/// ```
/// use weft_core::RequestPath;
///
/// let path: RequestPath = "app->editor:2".parse().unwrap();
/// assert_eq!(path.to_string_form(true), "app:0->editor:2");
/// assert_eq!(path.to_string_form(false), "app->editor");
///
/// let child = path.augment("toolbar", 0);
/// assert_eq!(child.len(), 3);
/// assert_eq!(path.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestPath {
    modules: Vec<ModuleId>,
}

impl RequestPath {
    pub fn new(modules: Vec<ModuleId>) -> Result<Self, AddressingError> {
        if modules.is_empty() {
            return Err(AddressingError::EmptyPath);
        }
        for (position, module) in modules.iter().enumerate() {
            validate_module_path(&module.module_path, position)?;
        }
        Ok(Self { modules })
    }

    /// Single-module path with instance id 0.
    pub fn root(module_path: impl Into<String>) -> Result<Self, AddressingError> {
        Self::new(vec![ModuleId::new(module_path, 0)])
    }

    pub fn parse(text: &str) -> Result<Self, AddressingError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AddressingError::EmptyPath);
        }
        let modules = text
            .split(CHAIN_SEPARATOR)
            .enumerate()
            .map(|(position, part)| ModuleId::parse_at(part, position))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(modules)
    }

    /// Serializes the chain; `unique` includes instance ids.
    pub fn to_string_form(&self, unique: bool) -> String {
        self.modules
            .iter()
            .map(|m| {
                if unique {
                    m.to_string()
                } else {
                    m.module_path.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(CHAIN_SEPARATOR)
    }

    /// Type form of the path, the key for instance id allocation.
    pub fn type_key(&self) -> String {
        self.to_string_form(false)
    }

    /// New path with one more module appended.
    pub fn augment(&self, module_path: impl Into<String>, instance_id: u32) -> Self {
        let mut modules = self.modules.clone();
        modules.push(ModuleId::new(module_path, instance_id));
        Self { modules }
    }

    /// New path with the last `remove_count` modules removed.
    pub fn sub_path(&self, remove_count: usize) -> Result<Self, AddressingError> {
        if remove_count >= self.modules.len() {
            return Err(AddressingError::EmptyPath);
        }
        Ok(Self {
            modules: self.modules[..self.modules.len() - remove_count].to_vec(),
        })
    }

    /// Module at `index`, or the last module when `index` is `None`.
    pub fn module_id(&self, index: Option<usize>) -> Option<&ModuleId> {
        match index {
            Some(i) => self.modules.get(i),
            None => self.modules.last(),
        }
    }

    pub fn last(&self) -> &ModuleId {
        // paths are non-empty by construction
        &self.modules[self.modules.len() - 1]
    }

    /// Same chain with the last module's instance id replaced.
    pub fn with_instance_id(&self, instance_id: u32) -> Self {
        let mut modules = self.modules.clone();
        if let Some(last) = modules.last_mut() {
            last.instance_id = instance_id;
        }
        Self { modules }
    }

    pub fn modules(&self) -> &[ModuleId] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_form(true))
    }
}

impl FromStr for RequestPath {
    type Err = AddressingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RequestPath {
    type Error = AddressingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RequestPath> for String {
    fn from(path: RequestPath) -> Self {
        path.to_string_form(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_instance_ids_and_defaults() {
        let path = RequestPath::parse("a:2 -> b").unwrap();
        assert_eq!(path.modules()[0], ModuleId::new("a", 2));
        assert_eq!(path.modules()[1], ModuleId::new("b", 0));
    }

    #[test]
    fn rejects_bad_instance_id() {
        let err = RequestPath::parse("a:x->b").unwrap_err();
        assert!(matches!(err, AddressingError::InvalidInstanceId { .. }));
    }

    #[test]
    fn serde_uses_unique_form() {
        let path = RequestPath::parse("a:1->b:3").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"a:1->b:3\"");
        let back: RequestPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }
}
