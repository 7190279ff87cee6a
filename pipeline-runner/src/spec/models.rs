// Bitbucket Pipelines Data Models
// Typed graph for bitbucket-pipelines.yml, with the parse-time structural rules

use crate::config::SpecConfig;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Message raised when a `variables` block is not the first pipeline item
pub const VARIABLES_FIRST_MESSAGE: &str = "'variables' can only be the first element of the list";

/// Message raised when an image asks for OIDC role assumption
pub const OIDC_UNSUPPORTED_MESSAGE: &str = "aws oidc-role not supported";

/// Root of a pipeline specification
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PipelineSpec {
    /// Default image for steps that do not declare one
    pub image: Option<Image>,

    pub definitions: Definitions,

    /// Global clone settings
    pub clone: CloneSettings,

    pub pipelines: Pipelines,
}

impl PipelineSpec {
    /// Addresses of every pipeline, in document order within each trigger class
    pub fn available_pipelines(&self) -> Vec<String> {
        self.pipelines.iter().map(|(address, _)| address).collect()
    }

    /// Look up a pipeline by address, e.g. `default`, `branches.main` or `custom.deploy`
    ///
    /// An empty `default` is not addressable, matching [`Self::available_pipelines`].
    pub fn pipeline(&self, address: &str) -> Option<&Pipeline> {
        if address == "default" {
            return (!self.pipelines.default.is_empty()).then_some(&self.pipelines.default);
        }

        let (class, name) = address.split_once('.')?;
        self.pipelines
            .named_groups()
            .into_iter()
            .find(|(group_class, _)| *group_class == class)
            .and_then(|(_, group)| group.get(name))
    }

    /// Image a step runs in: its own, else the pipeline default, else the configured default
    pub fn image_for(&self, step: &Step, config: &SpecConfig) -> Image {
        step.image
            .clone()
            .or_else(|| self.image.clone())
            .unwrap_or_else(|| Image::new(config.default_image.clone()))
    }

    /// Clone settings of a step, falling back field by field to the global ones
    pub fn clone_settings_for(&self, step: &Step) -> CloneSettings {
        step.clone.or(&self.clone)
    }
}

// =============================================================================
// Definitions
// =============================================================================

/// Shared cache and service definitions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Definitions {
    /// Cache name to path inside the build container
    pub caches: BTreeMap<String, String>,

    pub services: BTreeMap<String, Service>,
}

/// Auxiliary container started next to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    pub environment: BTreeMap<String, String>,

    /// Memory limit in MB
    pub memory: u32,
}

impl Service {
    pub fn image_or_default(&self, config: &SpecConfig) -> Image {
        self.image
            .clone()
            .unwrap_or_else(|| Image::new(config.default_image.clone()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DefinitionsDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    caches: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "null_as_default")]
    services: BTreeMap<String, ServiceDocument>,
}

impl DefinitionsDocument {
    pub(crate) fn resolve(self, config: &SpecConfig) -> Definitions {
        let services = self
            .services
            .into_iter()
            .map(|(name, doc)| {
                let service = doc.resolve(&name, config);
                (name, service)
            })
            .collect();

        Definitions {
            caches: self.caches,
            services,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceDocument {
    #[serde(default)]
    image: Option<Image>,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    environment: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    variables: BTreeMap<String, String>,

    #[serde(default)]
    memory: Option<u32>,
}

impl ServiceDocument {
    // `variables` first, then `environment`: environment wins on shared keys
    fn resolve(self, name: &str, config: &SpecConfig) -> Service {
        let mut environment = self.variables;
        environment.extend(self.environment);

        Service {
            image: self.image,
            environment,
            memory: self
                .memory
                .unwrap_or_else(|| config.default_memory_for(name)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct SpecDocument {
    #[serde(default)]
    image: Option<Image>,

    #[serde(default, deserialize_with = "null_as_default")]
    definitions: DefinitionsDocument,

    #[serde(default, deserialize_with = "null_as_default")]
    clone: CloneSettings,

    #[serde(default, deserialize_with = "null_as_default")]
    pipelines: Pipelines,
}

impl SpecDocument {
    pub(crate) fn resolve(self, config: &SpecConfig) -> PipelineSpec {
        PipelineSpec {
            image: self.image,
            definitions: self.definitions.resolve(config),
            clone: self.clone,
            pipelines: self.pipelines,
        }
    }
}

// =============================================================================
// Images
// =============================================================================

/// Container image reference with optional registry credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    /// Image name; never subject to variable expansion
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCredentials>,
}

impl Image {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            username: None,
            password: None,
            email: None,
            run_as_user: None,
            aws: None,
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::String(name) => Ok(Image::new(name)),
            Value::Mapping(_) => {
                let doc: ImageDocument =
                    serde_yaml::from_value(value).map_err(|e| format!("invalid image: {}", e))?;
                Image::try_from(doc)
            }
            _ => Err("image must be a name or a mapping with a 'name' key".to_string()),
        }
    }
}

/// Static AWS credentials for pulling from ECR
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwsCredentials {
    #[serde(rename = "access-key")]
    pub access_key_id: String,

    #[serde(rename = "secret-key")]
    pub secret_access_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ImageDocument {
    name: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    run_as_user: Option<u32>,
    #[serde(default)]
    aws: Option<AwsDocument>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct AwsDocument {
    #[serde(default)]
    access_key: Option<String>,
    #[serde(default)]
    secret_key: Option<String>,
    #[serde(default)]
    oidc_role: Option<String>,
}

impl TryFrom<ImageDocument> for Image {
    type Error = String;

    fn try_from(doc: ImageDocument) -> Result<Self, Self::Error> {
        let aws = match doc.aws {
            None => None,
            Some(aws) => Some(AwsCredentials::try_from(aws)?),
        };

        Ok(Image {
            name: doc.name,
            username: doc.username,
            password: doc.password,
            email: doc.email,
            run_as_user: doc.run_as_user,
            aws,
        })
    }
}

impl TryFrom<AwsDocument> for AwsCredentials {
    type Error = String;

    fn try_from(doc: AwsDocument) -> Result<Self, Self::Error> {
        if doc.oidc_role.is_some() {
            return Err(OIDC_UNSUPPORTED_MESSAGE.to_string());
        }

        match (doc.access_key, doc.secret_key) {
            (Some(access_key_id), Some(secret_access_key)) => Ok(AwsCredentials {
                access_key_id,
                secret_access_key,
            }),
            _ => Err("aws credentials need both 'access-key' and 'secret-key'".to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Image {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Image::from_value(value).map_err(de::Error::custom)
    }
}

// =============================================================================
// Clone settings
// =============================================================================

/// Repository clone behaviour, globally or per step
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloneSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<CloneDepth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lfs: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl CloneSettings {
    /// Fill every unset field from `fallback`
    pub fn or(&self, fallback: &CloneSettings) -> CloneSettings {
        CloneSettings {
            depth: self.depth.or(fallback.depth),
            lfs: self.lfs.or(fallback.lfs),
            enabled: self.enabled.or(fallback.enabled),
        }
    }
}

/// `clone.depth`: a commit count or `full`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneDepth {
    Full,
    Commits(u32),
}

impl Serialize for CloneDepth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CloneDepth::Full => serializer.serialize_str("full"),
            CloneDepth::Commits(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for CloneDepth {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let invalid = || de::Error::custom("clone depth must be a positive integer or 'full'");

        match Value::deserialize(deserializer)? {
            Value::String(s) if s == "full" => Ok(CloneDepth::Full),
            Value::Number(n) => n
                .as_u64()
                .filter(|n| *n > 0)
                .and_then(|n| u32::try_from(n).ok())
                .map(CloneDepth::Commits)
                .ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

// =============================================================================
// Pipelines
// =============================================================================

/// Pipelines grouped by trigger class
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Pipelines {
    #[serde(default)]
    pub default: Pipeline,

    #[serde(default)]
    pub branches: NamedPipelines,

    #[serde(default)]
    pub pull_requests: NamedPipelines,

    #[serde(default)]
    pub custom: NamedPipelines,

    #[serde(default)]
    pub tags: NamedPipelines,

    /// Mercurial bookmark pipelines, kept for older repositories
    #[serde(default, skip_serializing_if = "NamedPipelines::is_empty")]
    pub bookmarks: NamedPipelines,
}

impl Pipelines {
    /// Every pipeline with its address; an empty `default` is skipped
    pub fn iter(&self) -> impl Iterator<Item = (String, &Pipeline)> + '_ {
        let default = (!self.default.is_empty()).then(|| ("default".to_string(), &self.default));

        default.into_iter().chain(
            self.named_groups()
                .into_iter()
                .flat_map(|(class, group)| {
                    group
                        .iter()
                        .map(move |(name, pipeline)| (format!("{}.{}", class, name), pipeline))
                }),
        )
    }

    fn named_groups(&self) -> [(&'static str, &NamedPipelines); 5] {
        [
            ("branches", &self.branches),
            ("pull-requests", &self.pull_requests),
            ("custom", &self.custom),
            ("tags", &self.tags),
            ("bookmarks", &self.bookmarks),
        ]
    }
}

/// Pipelines keyed by branch pattern or custom name, in document order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamedPipelines(Vec<(String, Pipeline)>);

impl NamedPipelines {
    pub fn get(&self, name: &str) -> Option<&Pipeline> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Pipeline)> {
        self.0.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, Pipeline)> for NamedPipelines {
    fn from_iter<I: IntoIterator<Item = (String, Pipeline)>>(iter: I) -> Self {
        NamedPipelines(iter.into_iter().collect())
    }
}

impl Serialize for NamedPipelines {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, pipeline) in &self.0 {
            map.serialize_entry(name, pipeline)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for NamedPipelines {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct NamedPipelinesVisitor;

        impl<'de> Visitor<'de> for NamedPipelinesVisitor {
            type Value = NamedPipelines;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map of pipeline names to pipelines")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(NamedPipelines::default())
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(NamedPipelines::default())
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut seen = HashSet::new();
                let mut pipelines = Vec::new();

                while let Some(key) = map.next_key::<Value>()? {
                    let name = scalar_to_string(key)
                        .ok_or_else(|| de::Error::custom("pipeline names must be scalars"))?;
                    if !seen.insert(name.clone()) {
                        return Err(de::Error::custom(format!(
                            "duplicate pipeline name '{}'",
                            name
                        )));
                    }
                    let pipeline = map.next_value::<Pipeline>()?;
                    pipelines.push((name, pipeline));
                }

                Ok(NamedPipelines(pipelines))
            }
        }

        deserializer.deserialize_any(NamedPipelinesVisitor)
    }
}

/// Ordered list of pipeline items
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Pipeline {
    items: Vec<PipelineItem>,
}

impl Pipeline {
    /// Build a pipeline, enforcing that `variables` can only lead the list
    pub fn new(items: Vec<PipelineItem>) -> Result<Self, String> {
        let misplaced = items
            .iter()
            .skip(1)
            .any(|item| matches!(item, PipelineItem::Variables(_)));

        if misplaced {
            return Err(VARIABLES_FIRST_MESSAGE.to_string());
        }

        Ok(Self { items })
    }

    pub fn items(&self) -> &[PipelineItem] {
        &self.items
    }

    /// Variables prompted for before the run; empty when not declared
    pub fn variables(&self) -> &[Variable] {
        match self.items.first() {
            Some(PipelineItem::Variables(vars)) => &vars.variables,
            _ => &[],
        }
    }

    /// Executable items: steps and parallel groups
    pub fn steps(&self) -> impl Iterator<Item = &PipelineItem> {
        self.items
            .iter()
            .filter(|item| !matches!(item, PipelineItem::Variables(_)))
    }

    /// Every step, with parallel groups flattened in order
    pub fn all_steps(&self) -> Vec<&Step> {
        self.steps()
            .flat_map(|item| match item {
                PipelineItem::Step(wrapper) => vec![&wrapper.step],
                PipelineItem::Parallel(group) => group.parallel.iter().map(|w| &w.step).collect(),
                PipelineItem::Variables(_) => Vec::new(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'de> Deserialize<'de> for Pipeline {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let items = Option::<Vec<PipelineItem>>::deserialize(deserializer)?.unwrap_or_default();
        Pipeline::new(items).map_err(de::Error::custom)
    }
}

/// One element of a pipeline, discriminated by its single key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PipelineItem {
    Variables(Variables),
    Step(StepWrapper),
    Parallel(ParallelSteps),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineItemDocument {
    #[serde(default)]
    variables: Option<Vec<Variable>>,
    #[serde(default)]
    step: Option<Step>,
    #[serde(default)]
    parallel: Option<Vec<StepWrapper>>,
}

impl TryFrom<PipelineItemDocument> for PipelineItem {
    type Error = String;

    fn try_from(doc: PipelineItemDocument) -> Result<Self, Self::Error> {
        match (doc.variables, doc.step, doc.parallel) {
            (Some(variables), None, None) => Ok(PipelineItem::Variables(Variables { variables })),
            (None, Some(step), None) => Ok(PipelineItem::Step(StepWrapper { step })),
            (None, None, Some(parallel)) => Ok(PipelineItem::Parallel(ParallelSteps { parallel })),
            _ => Err(
                "each pipeline item must have exactly one of 'variables', 'step' or 'parallel'"
                    .to_string(),
            ),
        }
    }
}

impl<'de> Deserialize<'de> for PipelineItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let doc = PipelineItemDocument::deserialize(deserializer)?;
        PipelineItem::try_from(doc).map_err(de::Error::custom)
    }
}

/// Leading `variables` block of a custom pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variables {
    pub variables: Vec<Variable>,
}

/// Variable prompted for when a custom pipeline is triggered
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Variable {
    pub name: String,

    #[serde(
        default,
        deserialize_with = "deserialize_optional_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_optional_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,

    /// Choices offered for the value; empty means free text
    #[serde(
        default,
        deserialize_with = "deserialize_scalar_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_values: Vec<String>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepWrapper {
    pub step: Step,
}

/// Steps the engine may run concurrently; order is kept for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParallelSteps {
    pub parallel: Vec<StepWrapper>,
}

// =============================================================================
// Steps
// =============================================================================

/// Unit of execution: a script run inside one container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Step {
    #[serde(default)]
    pub name: Option<String>,

    pub script: Vec<ScriptItem>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub after_script: Vec<ScriptItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub caches: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub services: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub artifacts: Vec<String>,

    #[serde(default)]
    pub size: StepSize,

    #[serde(default, deserialize_with = "null_as_default")]
    pub clone: CloneSettings,

    #[serde(default)]
    pub deployment: Option<String>,

    #[serde(default)]
    pub trigger: Trigger,

    #[serde(default)]
    pub max_time: Option<u32>,
}

impl Step {
    pub fn new(name: impl Into<String>, script: Vec<ScriptItem>) -> Self {
        Self {
            name: Some(name.into()),
            script,
            after_script: Vec::new(),
            image: None,
            caches: Vec::new(),
            services: Vec::new(),
            artifacts: Vec::new(),
            size: StepSize::default(),
            clone: CloneSettings::default(),
            deployment: None,
            trigger: Trigger::default(),
            max_time: None,
        }
    }

    /// Name shown in logs; unnamed steps get a placeholder
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// Whether any script line invokes a pipe, which needs a docker daemon
    pub fn uses_pipes(&self) -> bool {
        self.script
            .iter()
            .chain(&self.after_script)
            .any(|item| matches!(item, ScriptItem::Pipe(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepSize {
    #[default]
    #[serde(rename = "1x")]
    Simple,
    #[serde(rename = "2x")]
    Double,
}

impl StepSize {
    /// Resource multiplier
    pub fn as_int(self) -> u32 {
        match self {
            StepSize::Simple => 1,
            StepSize::Double => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    #[default]
    Automatic,
    Manual,
}

/// A script line: a shell command or a pipe invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ScriptItem {
    Command(String),
    Pipe(Pipe),
}

impl From<&str> for ScriptItem {
    fn from(command: &str) -> Self {
        ScriptItem::Command(command.to_string())
    }
}

impl<'de> Deserialize<'de> for ScriptItem {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            value @ Value::Mapping(_) => serde_yaml::from_value(value)
                .map(ScriptItem::Pipe)
                .map_err(|e| de::Error::custom(format!("invalid pipe: {}", e))),
            value => scalar_to_string(value)
                .map(ScriptItem::Command)
                .ok_or_else(|| {
                    de::Error::custom("script items must be a command or a pipe invocation")
                }),
        }
    }
}

/// Reusable third-party step invoked from a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipe {
    pub pipe: String,

    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub variables: BTreeMap<String, String>,
}

// =============================================================================
// Deserialization helpers
// =============================================================================

/// Treat an explicit `null` the same as an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Map of names to scalar values, with numbers and booleans kept as their text
fn deserialize_string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();

    raw.into_iter()
        .map(|(key, value)| match scalar_to_string(value) {
            Some(text) => Ok((key, text)),
            None => Err(de::Error::custom(format!(
                "value of '{}' must be a string, number or boolean",
                key
            ))),
        })
        .collect()
}

fn deserialize_optional_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => scalar_to_string(value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("expected a string, number or boolean")),
    }
}

fn deserialize_scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<Value>>::deserialize(deserializer)?
        .unwrap_or_default()
        .into_iter()
        .map(|value| {
            scalar_to_string(value)
                .ok_or_else(|| de::Error::custom("list entries must be strings, numbers or booleans"))
        })
        .collect()
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse<T: serde::de::DeserializeOwned>(yaml: &str) -> Result<T, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    fn step(name: &str, script: &[&str]) -> StepWrapper {
        StepWrapper {
            step: Step::new(name, script.iter().map(|s| ScriptItem::from(*s)).collect()),
        }
    }

    #[test]
    fn test_parse_image_from_string() {
        let image: Image = parse("alpine:latest").unwrap();
        assert_eq!(image, Image::new("alpine:latest"));
    }

    #[test]
    fn test_parse_image_with_run_as_user() {
        let image: Image = parse("name: alpine:latest\nrun-as-user: 1000\n").unwrap();
        assert_eq!(image.name, "alpine:latest");
        assert_eq!(image.run_as_user, Some(1000));
    }

    #[test]
    fn test_parse_image_with_credentials() {
        let yaml = r#"
name: private-repo/image
username: my-username
password: my-password
email: my-email
"#;
        let image: Image = parse(yaml).unwrap();
        assert_eq!(image.username.as_deref(), Some("my-username"));
        assert_eq!(image.password.as_deref(), Some("my-password"));
        assert_eq!(image.email.as_deref(), Some("my-email"));
        assert!(image.aws.is_none());
    }

    #[test]
    fn test_parse_image_with_aws_credentials() {
        let yaml = r#"
name: aws-repo/image
aws:
  access-key: access-key-id
  secret-key: secret-access-key
"#;
        let image: Image = parse(yaml).unwrap();
        assert_eq!(
            image.aws,
            Some(AwsCredentials {
                access_key_id: "access-key-id".to_string(),
                secret_access_key: "secret-access-key".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_image_with_aws_oidc_role_fails() {
        let yaml = "name: alpine:latest\naws:\n  oidc-role: some-role\n";
        let err = parse::<Image>(yaml).unwrap_err();
        assert!(err.to_string().contains("oidc-role"));
    }

    #[test]
    fn test_parse_image_with_partial_aws_credentials_fails() {
        let yaml = "name: alpine:latest\naws:\n  access-key: only-this\n";
        let err = parse::<Image>(yaml).unwrap_err();
        assert!(err.to_string().contains("secret-key"));
    }

    #[test]
    fn test_parse_image_rejects_unknown_key() {
        let err = parse::<Image>("name: alpine\nrun_as_user: 1000\n").unwrap_err();
        assert!(err.to_string().contains("run_as_user"));
    }

    #[test]
    fn test_parse_image_rejects_sequence() {
        assert!(parse::<Image>("- alpine\n").is_err());
    }

    #[test]
    fn test_parse_pipeline_with_steps() {
        let yaml = r#"
- step:
    name: Step 1
    script:
      - cat /etc/os-release
      - exit 0
- step:
    name: Step 2
    script:
      - echo 'Step 2'
"#;
        let pipeline: Pipeline = parse(yaml).unwrap();
        let expected = Pipeline::new(vec![
            PipelineItem::Step(step("Step 1", &["cat /etc/os-release", "exit 0"])),
            PipelineItem::Step(step("Step 2", &["echo 'Step 2'"])),
        ])
        .unwrap();

        assert_eq!(pipeline, expected);
    }

    #[test]
    fn test_parse_pipeline_with_parallel_steps() {
        let yaml = r#"
- step:
    name: Step 1
    script: [cat /etc/os-release, exit 0]
- parallel:
    - step:
        name: Parallel Step 1
        script: [echo 'Parallel 1']
    - step:
        name: Parallel Step 2
        script: [echo 'Parallel 2']
"#;
        let pipeline: Pipeline = parse(yaml).unwrap();
        let expected = Pipeline::new(vec![
            PipelineItem::Step(step("Step 1", &["cat /etc/os-release", "exit 0"])),
            PipelineItem::Parallel(ParallelSteps {
                parallel: vec![
                    step("Parallel Step 1", &["echo 'Parallel 1'"]),
                    step("Parallel Step 2", &["echo 'Parallel 2'"]),
                ],
            }),
        ])
        .unwrap();

        assert_eq!(pipeline, expected);

        let names: Vec<&str> = pipeline.all_steps().iter().map(|s| s.display_name()).collect();
        assert_eq!(names, vec!["Step 1", "Parallel Step 1", "Parallel Step 2"]);
    }

    #[test]
    fn test_parse_pipeline_with_variables() {
        let yaml = r#"
- variables:
    - name: foo
    - name: bar
      default: 3
- step:
    name: Step 1
    script: [exit 0]
"#;
        let pipeline: Pipeline = parse(yaml).unwrap();

        assert_eq!(
            pipeline.variables(),
            &[
                Variable::new("foo"),
                Variable {
                    name: "bar".to_string(),
                    default: Some("3".to_string()),
                    ..Default::default()
                },
            ]
        );
        assert_eq!(pipeline.steps().count(), 1);
    }

    #[test]
    fn test_parse_variable_with_description_and_allowed_values() {
        let yaml = r#"
- variables:
    - name: ENVIRONMENT
      description: Where to deploy
      default: staging
      allowed-values: [staging, production]
- step:
    script: [exit 0]
"#;
        let pipeline: Pipeline = parse(yaml).unwrap();
        let variable = &pipeline.variables()[0];

        assert_eq!(variable.description.as_deref(), Some("Where to deploy"));
        assert_eq!(variable.default.as_deref(), Some("staging"));
        assert_eq!(variable.allowed_values, vec!["staging", "production"]);
    }

    #[test]
    fn test_variable_rejects_misspelled_key() {
        assert!(parse::<Variable>("name: foo
defualt: bar
").is_err());
    }

    #[test]
    fn test_parse_bookmark_pipelines() {
        let pipelines: Pipelines =
            parse("bookmarks:
  release:
    - step: {script: [make]}
").unwrap();

        let addresses: Vec<String> = pipelines.iter().map(|(address, _)| address).collect();
        assert_eq!(addresses, vec!["bookmarks.release"]);
    }

    #[test]
    fn test_empty_default_pipeline_is_not_addressable() {
        let spec = PipelineSpec {
            pipelines: parse("custom:
  deploy:
    - step: {script: [make]}
").unwrap(),
            ..Default::default()
        };

        assert_eq!(spec.available_pipelines(), vec!["custom.deploy"]);
        assert!(spec.pipeline("default").is_none());
        assert!(spec.pipeline("custom.deploy").is_some());
    }

    #[test]
    fn test_variables_can_only_be_the_first_element() {
        let yaml = r#"
- step:
    name: Step 1
    script: [exit 0]
- variables:
    - name: foo
"#;
        let err = parse::<Pipeline>(yaml).unwrap_err().to_string();
        assert!(err.contains("variables"));
        assert!(err.contains("first element"));
    }

    #[test]
    fn test_pipeline_item_with_two_keys_fails() {
        let yaml = r#"
- step:
    script: [exit 0]
  parallel: []
"#;
        let err = parse::<Pipeline>(yaml).unwrap_err().to_string();
        assert!(err.contains("exactly one"));
    }

    #[test]
    fn test_pipeline_item_with_unknown_key_fails() {
        let err = parse::<Pipeline>("- stage:\n    name: nope\n").unwrap_err();
        assert!(err.to_string().contains("stage"));
    }

    #[test]
    fn test_null_pipeline_is_empty() {
        let pipelines: Pipelines = parse("default:\ncustom:\n").unwrap();
        assert!(pipelines.default.is_empty());
        assert!(pipelines.custom.is_empty());
    }

    #[test]
    fn test_parse_step_with_default_values() {
        let step: Step = parse("name: Step 1\nscript: [exit 0]\n").unwrap();

        assert_eq!(step, Step::new("Step 1", vec!["exit 0".into()]));
        assert!(step.after_script.is_empty());
        assert!(step.caches.is_empty());
        assert!(step.services.is_empty());
        assert!(step.artifacts.is_empty());
        assert_eq!(step.size, StepSize::Simple);
        assert_eq!(step.trigger, Trigger::Automatic);
    }

    #[test]
    fn test_parse_step_with_null_collections() {
        let step: Step = parse("script: []\ncaches:\nservices:\nafter-script:\n").unwrap();
        assert!(step.caches.is_empty());
        assert!(step.services.is_empty());
        assert!(step.after_script.is_empty());
    }

    #[test]
    fn test_parse_step_without_script_fails() {
        assert!(parse::<Step>("name: No script\n").is_err());
    }

    #[test]
    fn test_parse_step_with_manual_trigger() {
        let step: Step = parse("script: []\ntrigger: manual\n").unwrap();
        assert_eq!(step.trigger, Trigger::Manual);
    }

    #[test]
    fn test_parse_step_with_double_size() {
        let step: Step = parse("script: []\nsize: 2x\n").unwrap();
        assert_eq!(step.size, StepSize::Double);
        assert_eq!(step.size.as_int(), 2);
    }

    #[test]
    fn test_parse_step_with_invalid_size_fails() {
        assert!(parse::<Step>("script: []\nsize: 3x\n").is_err());
        assert!(parse::<Step>("script: []\ntrigger: sometimes\n").is_err());
    }

    #[test]
    fn test_parse_step_with_max_time_and_deployment() {
        let step: Step = parse("script: []\nmax-time: 30\ndeployment: staging\n").unwrap();
        assert_eq!(step.max_time, Some(30));
        assert_eq!(step.deployment.as_deref(), Some("staging"));
    }

    #[test]
    fn test_parse_step_with_pipes() {
        let yaml = r#"
script:
  - echo a
  - pipe: atlassian/trigger-pipeline:4.2.1
    variables:
      BITBUCKET_USERNAME: ${TRIGGER_PIPELINE_USERNAME}
      REPOSITORY: other-repo
      WAIT: true
  - echo b
after-script:
  - echo c
"#;
        let step: Step = parse(yaml).unwrap();

        let expected_pipe = Pipe {
            pipe: "atlassian/trigger-pipeline:4.2.1".to_string(),
            variables: BTreeMap::from([
                (
                    "BITBUCKET_USERNAME".to_string(),
                    "${TRIGGER_PIPELINE_USERNAME}".to_string(),
                ),
                ("REPOSITORY".to_string(), "other-repo".to_string()),
                ("WAIT".to_string(), "true".to_string()),
            ]),
        };

        assert_eq!(
            step.script,
            vec![
                ScriptItem::Command("echo a".to_string()),
                ScriptItem::Pipe(expected_pipe),
                ScriptItem::Command("echo b".to_string()),
            ]
        );
        assert!(step.uses_pipes());
    }

    #[test]
    fn test_parse_pipe_with_unknown_key_fails() {
        let err = parse::<Step>("script:\n  - pipe: a/b:1\n    image: x\n").unwrap_err();
        assert!(err.to_string().contains("invalid pipe"));
    }

    #[test]
    fn test_parse_clone_settings() {
        let clone: CloneSettings = parse("depth: full\nlfs: true\n").unwrap();
        assert_eq!(clone.depth, Some(CloneDepth::Full));
        assert_eq!(clone.lfs, Some(true));

        let clone: CloneSettings = parse("depth: 50\n").unwrap();
        assert_eq!(clone.depth, Some(CloneDepth::Commits(50)));

        assert!(parse::<CloneSettings>("depth: 0\n").is_err());
        assert!(parse::<CloneSettings>("depth: shallow\n").is_err());
    }

    #[test]
    fn test_clone_settings_fallback() {
        let global = CloneSettings {
            depth: Some(CloneDepth::Commits(10)),
            lfs: Some(true),
            enabled: None,
        };
        let step = CloneSettings {
            depth: Some(CloneDepth::Full),
            ..Default::default()
        };

        let merged = step.or(&global);
        assert_eq!(merged.depth, Some(CloneDepth::Full));
        assert_eq!(merged.lfs, Some(true));
        assert_eq!(merged.enabled, None);
    }

    #[test]
    fn test_named_pipelines_keep_document_order() {
        let yaml = r#"
zeta:
  - step: {script: [exit 0]}
alpha:
  - step: {script: [exit 0]}
"#;
        let pipelines: NamedPipelines = parse(yaml).unwrap();
        assert_eq!(pipelines.names(), vec!["zeta", "alpha"]);
        assert!(pipelines.get("alpha").is_some());
        assert!(pipelines.get("beta").is_none());
    }

    #[test]
    fn test_service_environment_wins_over_variables() {
        let doc: ServiceDocument = parse(
            "variables:\n  SHARED: from-variables\n  ONLY_VAR: a\nenvironment:\n  SHARED: from-environment\n",
        )
        .unwrap();

        let service = doc.resolve("db", &SpecConfig::default());
        assert_eq!(service.environment["SHARED"], "from-environment");
        assert_eq!(service.environment["ONLY_VAR"], "a");
        assert_eq!(service.memory, 1024);
    }

    #[test]
    fn test_service_environment_rejects_nested_values() {
        assert!(parse::<ServiceDocument>("environment:\n  NESTED:\n    a: b\n").is_err());
    }

    #[test]
    fn test_serialize_step_uses_hyphenated_keys() {
        let mut step = Step::new("Build", vec!["make".into()]);
        step.max_time = Some(5);

        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("after-script").is_some());
        assert_eq!(json["max-time"], 5);
        assert_eq!(json["size"], "1x");
        assert_eq!(json["trigger"], "automatic");
    }
}
