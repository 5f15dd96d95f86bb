use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::ToolSpec;
use crate::domain::types::{ParamType, ToolDeclaration};

/// Startup-time registration failures. Any of these prevents the process
/// from serving traffic.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name '{name}'")]
    DuplicateTool { name: String },
    #[error("tool '{tool}' has an empty command template")]
    EmptyTemplate { tool: String },
    #[error("tool '{tool}' puts a substitution slot in program position")]
    SlotAsProgram { tool: String },
    #[error("tool '{tool}' declares no parameters but its template expects '<{slot}>'")]
    UnexpectedSlot { tool: String, slot: String },
    #[error("tool '{tool}' declares parameter '{param}' but its template has no '<{param}>' slot")]
    MissingSlot { tool: String, param: String },
    #[error("tool '{tool}' template slot '<{slot}>' does not match any declared parameter")]
    UnknownSlot { tool: String, slot: String },
    #[error("tool '{tool}' template has more than one substitution slot")]
    MultipleSlots { tool: String },
    #[error("tool '{tool}' declares {count} parameters; at most one is supported")]
    TooManyParams { tool: String, count: usize },
    #[error("tool '{tool}' parameter '{param}' is a number; only string parameters can be substituted")]
    NumberParam { tool: String, param: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateToken {
    Literal(String),
    Slot(String),
}

/// A pre-tokenized external command line. At most one token is a `<slot>`
/// placeholder that invocation fills with the single string argument; the
/// resolved argv is spawned directly, never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    program: String,
    args: Vec<TemplateToken>,
}

impl CommandTemplate {
    pub fn parse(tool: &str, template: &str) -> Result<Self, RegistryError> {
        let mut tokens = template.split_whitespace();
        let program = tokens
            .next()
            .ok_or_else(|| RegistryError::EmptyTemplate {
                tool: tool.to_string(),
            })?
            .to_string();
        if slot_name(&program).is_some() {
            return Err(RegistryError::SlotAsProgram {
                tool: tool.to_string(),
            });
        }

        let args = tokens
            .map(|token| match slot_name(token) {
                Some(name) => TemplateToken::Slot(name.to_string()),
                None => TemplateToken::Literal(token.to_string()),
            })
            .collect();

        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Name of the single substitution slot, if the template has one.
    pub fn slot(&self) -> Option<&str> {
        self.args.iter().find_map(|token| match token {
            TemplateToken::Slot(name) => Some(name.as_str()),
            TemplateToken::Literal(_) => None,
        })
    }

    fn slot_count(&self) -> usize {
        self.args
            .iter()
            .filter(|token| matches!(token, TemplateToken::Slot(_)))
            .count()
    }

    /// Resolves the argv tail, filling the slot with `argument`. `None` when
    /// the template has a slot and no argument was supplied.
    pub fn resolve(&self, argument: Option<&str>) -> Option<Vec<String>> {
        let mut argv = Vec::with_capacity(self.args.len());
        for token in &self.args {
            match token {
                TemplateToken::Literal(text) => argv.push(text.clone()),
                TemplateToken::Slot(_) => argv.push(argument?.to_string()),
            }
        }
        Some(argv)
    }
}

fn slot_name(token: &str) -> Option<&str> {
    let inner = token.strip_prefix('<')?.strip_suffix('>')?;
    if inner.is_empty() { None } else { Some(inner) }
}

/// One invokable capability: the model-facing declaration plus the command
/// binding that backs it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub title: String,
    pub description: String,
    pub input_schema: BTreeMap<String, ParamType>,
    pub template: CommandTemplate,
}

impl ToolDescriptor {
    pub fn from_spec(spec: &ToolSpec) -> Result<Self, RegistryError> {
        let template = CommandTemplate::parse(&spec.name, &spec.command)?;
        let title = spec.title.clone().unwrap_or_else(|| spec.name.clone());
        let description = spec.description.clone().unwrap_or_else(|| title.clone());
        let descriptor = Self {
            name: spec.name.clone(),
            title,
            description,
            input_schema: spec.input.clone(),
            template,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// The wire shape advertised for model planning; omits the command.
    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::new(
            self.name.clone(),
            self.title.clone(),
            self.description.clone(),
            self.input_schema.clone(),
        )
    }

    /// Name of the single required parameter, if the tool takes one.
    pub fn required_param(&self) -> Option<&str> {
        self.input_schema.keys().next().map(String::as_str)
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.template.slot_count() > 1 {
            return Err(RegistryError::MultipleSlots {
                tool: self.name.clone(),
            });
        }
        if self.input_schema.len() > 1 {
            return Err(RegistryError::TooManyParams {
                tool: self.name.clone(),
                count: self.input_schema.len(),
            });
        }

        match (self.input_schema.iter().next(), self.template.slot()) {
            (None, None) => Ok(()),
            (None, Some(slot)) => Err(RegistryError::UnexpectedSlot {
                tool: self.name.clone(),
                slot: slot.to_string(),
            }),
            (Some((param, _)), None) => Err(RegistryError::MissingSlot {
                tool: self.name.clone(),
                param: param.clone(),
            }),
            (Some((param, kind)), Some(slot)) => {
                if *kind != ParamType::String {
                    return Err(RegistryError::NumberParam {
                        tool: self.name.clone(),
                        param: param.clone(),
                    });
                }
                if param != slot {
                    return Err(RegistryError::UnknownSlot {
                        tool: self.name.clone(),
                        slot: slot.to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// The immutable tool set this process exposes. Built once at startup,
/// shared read-only afterwards.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    entries: Vec<Arc<ToolDescriptor>>,
    index: HashMap<String, Arc<ToolDescriptor>>,
}

impl ToolRegistry {
    pub fn from_specs(specs: &[ToolSpec]) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for spec in specs {
            registry.register(ToolDescriptor::from_spec(spec)?)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), RegistryError> {
        if self.index.contains_key(&descriptor.name) {
            return Err(RegistryError::DuplicateTool {
                name: descriptor.name,
            });
        }
        debug!(tool = %descriptor.name, slot = ?descriptor.template.slot(), "Registered tool");
        let descriptor = Arc::new(descriptor);
        self.index
            .insert(descriptor.name.clone(), Arc::clone(&descriptor));
        self.entries.push(descriptor);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<ToolDescriptor>> {
        self.index.get(name).cloned()
    }

    pub fn list(&self) -> Vec<ToolDeclaration> {
        self.entries.iter().map(|entry| entry.declaration()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, params: &[(&str, ParamType)]) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            title: None,
            description: None,
            command: command.to_string(),
            input: params
                .iter()
                .map(|(param, kind)| (param.to_string(), *kind))
                .collect(),
        }
    }

    #[test]
    fn parses_slotless_template() {
        let template = CommandTemplate::parse("list-devices", "spc devices").unwrap();
        assert_eq!(template.program(), "spc");
        assert_eq!(template.slot(), None);
        assert_eq!(template.resolve(None).unwrap(), vec!["devices".to_string()]);
    }

    #[test]
    fn parses_and_fills_slot() {
        let template = CommandTemplate::parse("device-state", "spc state <plugName>").unwrap();
        assert_eq!(template.slot(), Some("plugName"));
        assert_eq!(
            template.resolve(Some("kitchen")).unwrap(),
            vec!["state".to_string(), "kitchen".to_string()]
        );
        assert_eq!(template.resolve(None), None);
    }

    #[test]
    fn rejects_empty_template() {
        let error = CommandTemplate::parse("broken", "   ").unwrap_err();
        assert!(matches!(error, RegistryError::EmptyTemplate { .. }));
    }

    #[test]
    fn rejects_slot_in_program_position() {
        let error = CommandTemplate::parse("broken", "<cmd> run").unwrap_err();
        assert!(matches!(error, RegistryError::SlotAsProgram { .. }));
    }

    #[test]
    fn accepts_zero_and_single_arg_shapes() {
        let registry = ToolRegistry::from_specs(&[
            spec("list-devices", "spc devices", &[]),
            spec(
                "device-state",
                "spc state <plugName>",
                &[("plugName", ParamType::String)],
            ),
        ])
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.resolve("device-state").unwrap().required_param(),
            Some("plugName")
        );
        assert!(registry.resolve("unknown").is_none());
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let error = ToolRegistry::from_specs(&[
            spec("list-devices", "spc devices", &[]),
            spec("list-devices", "spc devices", &[]),
        ])
        .unwrap_err();
        assert!(matches!(error, RegistryError::DuplicateTool { name } if name == "list-devices"));
    }

    #[test]
    fn slot_without_declared_param_is_fatal() {
        let error =
            ToolRegistry::from_specs(&[spec("device-state", "spc state <plugName>", &[])])
                .unwrap_err();
        assert!(matches!(error, RegistryError::UnexpectedSlot { slot, .. } if slot == "plugName"));
    }

    #[test]
    fn declared_param_without_slot_is_fatal() {
        let error = ToolRegistry::from_specs(&[spec(
            "device-state",
            "spc state",
            &[("plugName", ParamType::String)],
        )])
        .unwrap_err();
        assert!(matches!(error, RegistryError::MissingSlot { param, .. } if param == "plugName"));
    }

    #[test]
    fn slot_naming_wrong_param_is_fatal() {
        let error = ToolRegistry::from_specs(&[spec(
            "device-state",
            "spc state <device>",
            &[("plugName", ParamType::String)],
        )])
        .unwrap_err();
        assert!(matches!(error, RegistryError::UnknownSlot { slot, .. } if slot == "device"));
    }

    #[test]
    fn second_parameter_is_fatal() {
        let error = ToolRegistry::from_specs(&[spec(
            "energy-range",
            "spc energy <from>",
            &[("from", ParamType::String), ("to", ParamType::String)],
        )])
        .unwrap_err();
        assert!(matches!(error, RegistryError::TooManyParams { count: 2, .. }));
    }

    #[test]
    fn number_parameter_is_fatal() {
        let error = ToolRegistry::from_specs(&[spec(
            "set-timer",
            "spc timer <minutes>",
            &[("minutes", ParamType::Number)],
        )])
        .unwrap_err();
        assert!(matches!(error, RegistryError::NumberParam { param, .. } if param == "minutes"));
    }

    #[test]
    fn declarations_never_expose_the_command() {
        let registry = ToolRegistry::from_specs(&[spec(
            "device-state",
            "spc state <plugName>",
            &[("plugName", ParamType::String)],
        )])
        .unwrap();
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        let value = serde_json::to_value(&listed[0]).unwrap();
        assert!(value.get("command").is_none());
        assert!(value.get("commandTemplate").is_none());
        assert_eq!(value["inputSchema"]["plugName"], "string");
    }
}
