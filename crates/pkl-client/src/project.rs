//! Pkl projects: decoding an evaluated `PklProject` and describing its
//! dependencies to the evaluator.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::bridge::protocol::{Checksums, ProjectOrDependency};
use crate::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}`: expected {expected}")]
    Type {
        field: &'static str,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub project_file_uri: String,
    pub tests: Vec<String>,
    pub dependencies: ProjectDependencies,
    pub package: Option<ProjectPackage>,
    pub evaluator_settings: Option<ProjectEvaluatorSettings>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectDependencies {
    pub local_dependencies: IndexMap<String, ProjectLocalDependency>,
    pub remote_dependencies: IndexMap<String, ProjectRemoteDependency>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectLocalDependency {
    pub package_uri: String,
    pub project_file_uri: String,
    pub dependencies: ProjectDependencies,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectRemoteDependency {
    pub package_uri: String,
    pub checksums: Option<Checksums>,
}

/// The `package` section of a project. Only read back, never sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPackage {
    pub name: String,
    pub base_uri: String,
    pub version: String,
    pub package_zip_url: String,
    pub description: Option<String>,
    pub authors: Vec<String>,
    pub website: Option<String>,
    pub documentation: Option<String>,
    pub source_code: Option<String>,
    pub source_code_url_scheme: Option<String>,
    pub license: Option<String>,
    pub license_text: Option<String>,
    pub issue_tracker: Option<String>,
    pub api_tests: Vec<String>,
    pub exclude: Vec<String>,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectEvaluatorSettings {
    pub external_properties: Option<HashMap<String, String>>,
    pub env: Option<HashMap<String, String>>,
    pub allowed_modules: Option<Vec<String>>,
    pub allowed_resources: Option<Vec<String>>,
    pub no_cache: Option<bool>,
    pub module_path: Option<Vec<String>>,
    pub module_cache_dir: Option<String>,
    pub root_dir: Option<String>,
}

impl Project {
    /// Decode the `output.value` of a `PklProject` module.
    pub fn from_value(value: &Value) -> Result<Self, ProjectError> {
        Ok(Self {
            project_file_uri: required_string(value, "projectFileUri")?,
            tests: string_list(value, "tests")?.unwrap_or_default(),
            dependencies: match field(value, "dependencies") {
                Some(deps) => ProjectDependencies::from_value(deps)?,
                None => ProjectDependencies::default(),
            },
            package: field(value, "package")
                .map(ProjectPackage::from_value)
                .transpose()?,
            evaluator_settings: field(value, "evaluatorSettings")
                .map(ProjectEvaluatorSettings::from_value)
                .transpose()?,
        })
    }

    /// Project directory, from the `file:` URI of its `PklProject` file.
    pub fn project_dir(&self) -> &str {
        let uri = &self.project_file_uri;
        let uri = uri.strip_prefix("file://").unwrap_or(uri);
        uri.strip_suffix("/PklProject").unwrap_or(uri)
    }
}

impl ProjectDependencies {
    fn from_value(value: &Value) -> Result<Self, ProjectError> {
        let mut deps = Self::default();
        for (name, dep) in named_entries(value, "localDependencies")? {
            deps.local_dependencies.insert(
                name,
                ProjectLocalDependency {
                    package_uri: required_string(dep, "packageUri")?,
                    project_file_uri: required_string(dep, "projectFileUri")?,
                    dependencies: match field(dep, "dependencies") {
                        Some(nested) => Self::from_value(nested)?,
                        None => Self::default(),
                    },
                },
            );
        }
        for (name, dep) in named_entries(value, "remoteDependencies")? {
            let checksums = match field(dep, "checksums") {
                Some(sums) => Some(Checksums {
                    sha256: required_string(sums, "sha256")?,
                }),
                None => None,
            };
            deps.remote_dependencies.insert(
                name,
                ProjectRemoteDependency {
                    package_uri: required_string(dep, "packageUri")?,
                    checksums,
                },
            );
        }
        Ok(deps)
    }

    pub fn is_empty(&self) -> bool {
        self.local_dependencies.is_empty() && self.remote_dependencies.is_empty()
    }

    /// Dependency descriptors as carried in the `project` field of
    /// CreateEvaluator. Local dependencies come first.
    pub fn encode(&self) -> IndexMap<String, ProjectOrDependency> {
        let local = self.local_dependencies.iter().map(|(name, dep)| {
            let descriptor = ProjectOrDependency {
                kind: Some("local".to_string()),
                package_uri: Some(dep.package_uri.clone()),
                project_file_uri: Some(dep.project_file_uri.clone()),
                checksums: None,
                dependencies: Some(dep.dependencies.encode()),
            };
            (name.clone(), descriptor)
        });
        let remote = self.remote_dependencies.iter().map(|(name, dep)| {
            let descriptor = ProjectOrDependency {
                kind: Some("remote".to_string()),
                package_uri: Some(dep.package_uri.clone()),
                project_file_uri: None,
                checksums: dep.checksums.clone(),
                dependencies: None,
            };
            (name.clone(), descriptor)
        });
        local.chain(remote).collect()
    }
}

impl ProjectPackage {
    fn from_value(value: &Value) -> Result<Self, ProjectError> {
        Ok(Self {
            name: required_string(value, "name")?,
            base_uri: required_string(value, "baseUri")?,
            version: required_string(value, "version")?,
            package_zip_url: required_string(value, "packageZipUrl")?,
            description: optional_string(value, "description")?,
            authors: string_list(value, "authors")?.unwrap_or_default(),
            website: optional_string(value, "website")?,
            documentation: optional_string(value, "documentation")?,
            source_code: optional_string(value, "sourceCode")?,
            source_code_url_scheme: optional_string(value, "sourceCodeUrlScheme")?,
            license: optional_string(value, "license")?,
            license_text: optional_string(value, "licenseText")?,
            issue_tracker: optional_string(value, "issueTracker")?,
            api_tests: string_list(value, "apiTests")?.unwrap_or_default(),
            exclude: string_list(value, "exclude")?.unwrap_or_default(),
            uri: optional_string(value, "uri")?,
        })
    }
}

impl ProjectEvaluatorSettings {
    fn from_value(value: &Value) -> Result<Self, ProjectError> {
        let no_cache = match field(value, "noCache") {
            Some(v) => Some(v.as_bool().ok_or(ProjectError::Type {
                field: "noCache",
                expected: "a boolean",
            })?),
            None => None,
        };
        Ok(Self {
            external_properties: string_map(value, "externalProperties")?,
            env: string_map(value, "env")?,
            allowed_modules: string_list(value, "allowedModules")?,
            allowed_resources: string_list(value, "allowedResources")?,
            no_cache,
            module_path: string_list(value, "modulePath")?,
            module_cache_dir: optional_string(value, "moduleCacheDir")?,
            root_dir: optional_string(value, "rootDir")?,
        })
    }
}

/// Non-null field of an object (or string-keyed map).
fn field<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    value.get(name).filter(|v| !v.is_null())
}

fn optional_string(value: &Value, name: &'static str) -> Result<Option<String>, ProjectError> {
    field(value, name)
        .map(|v| {
            v.as_str().map(str::to_string).ok_or(ProjectError::Type {
                field: name,
                expected: "a string",
            })
        })
        .transpose()
}

fn required_string(value: &Value, name: &'static str) -> Result<String, ProjectError> {
    optional_string(value, name)?.ok_or(ProjectError::Missing(name))
}

fn string_list(value: &Value, name: &'static str) -> Result<Option<Vec<String>>, ProjectError> {
    let Some(list) = field(value, name) else {
        return Ok(None);
    };
    let items = match list {
        Value::List(items) | Value::Set(items) => items,
        Value::Dynamic(obj) => &obj.elements,
        _ => {
            return Err(ProjectError::Type {
                field: name,
                expected: "a list of strings",
            });
        }
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or(ProjectError::Type {
                field: name,
                expected: "a list of strings",
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Entries of a map-like field keyed by string, in declaration order.
fn named_entries<'a>(
    value: &'a Value,
    name: &'static str,
) -> Result<Vec<(String, &'a Value)>, ProjectError> {
    let bad_key = ProjectError::Type {
        field: name,
        expected: "a map keyed by string",
    };
    match field(value, name) {
        None => Ok(Vec::new()),
        Some(Value::Map(entries)) => entries
            .iter()
            .map(|(k, v)| match k {
                Value::String(k) => Ok((k.clone(), v)),
                _ => Err(ProjectError::Type {
                    field: name,
                    expected: "a map keyed by string",
                }),
            })
            .collect(),
        Some(Value::Dynamic(obj)) => {
            let mut out: Vec<(String, &Value)> =
                obj.properties.iter().map(|(k, v)| (k.clone(), v)).collect();
            for (k, v) in &obj.entries {
                match k {
                    Value::String(k) => out.push((k.clone(), v)),
                    _ => return Err(bad_key),
                }
            }
            Ok(out)
        }
        Some(_) => Err(bad_key),
    }
}

fn string_map(
    value: &Value,
    name: &'static str,
) -> Result<Option<HashMap<String, String>>, ProjectError> {
    if field(value, name).is_none() {
        return Ok(None);
    }
    named_entries(value, name)?
        .into_iter()
        .map(|(k, v)| match v.as_str() {
            Some(v) => Ok((k, v.to_string())),
            None => Err(ProjectError::Type {
                field: name,
                expected: "a map of strings",
            }),
        })
        .collect::<Result<HashMap<_, _>, _>>()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DynamicObject, TypedObject};

    fn object(name: &str, props: Vec<(&str, Value)>) -> Value {
        Value::Object(TypedObject {
            name: name.to_string(),
            module_uri: "pkl:Project".to_string(),
            properties: props
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        })
    }

    fn s(text: &str) -> Value {
        Value::String(text.to_string())
    }

    fn sample_project() -> Value {
        let remote = object(
            "RemoteDependency",
            vec![
                ("packageUri", s("package://example.com/birds@0.5.0")),
                ("checksums", object("Checksums", vec![("sha256", s("abc123"))])),
            ],
        );
        let local = object(
            "Project",
            vec![
                ("projectFileUri", s("file:///work/lib/PklProject")),
                ("packageUri", s("package://example.com/lib@1.0.0")),
                ("dependencies", object("Dependencies", vec![])),
            ],
        );
        let deps = object(
            "Dependencies",
            vec![
                (
                    "localDependencies",
                    Value::Map(vec![(s("lib"), local)]),
                ),
                (
                    "remoteDependencies",
                    Value::Map(vec![(s("birds"), remote)]),
                ),
            ],
        );
        let settings = object(
            "EvaluatorSettings",
            vec![
                ("env", Value::Map(vec![(s("HOME"), s("/home/pkl"))])),
                ("allowedModules", Value::List(vec![s("file:"), s("pkl:")])),
                ("noCache", Value::Bool(true)),
                ("moduleCacheDir", s("/tmp/cache")),
                ("rootDir", Value::Null),
            ],
        );
        object(
            "Project",
            vec![
                ("projectFileUri", s("file:///work/app/PklProject")),
                ("tests", Value::List(vec![s("test.pkl")])),
                ("dependencies", deps),
                ("package", Value::Null),
                ("evaluatorSettings", settings),
            ],
        )
    }

    #[test]
    fn decodes_project() {
        let project = Project::from_value(&sample_project()).unwrap();
        assert_eq!(project.project_dir(), "/work/app");
        assert_eq!(project.tests, vec!["test.pkl"]);
        assert!(project.package.is_none());

        let lib = &project.dependencies.local_dependencies["lib"];
        assert_eq!(lib.project_file_uri, "file:///work/lib/PklProject");
        assert!(lib.dependencies.is_empty());

        let birds = &project.dependencies.remote_dependencies["birds"];
        assert_eq!(birds.checksums.as_ref().unwrap().sha256, "abc123");

        let settings = project.evaluator_settings.unwrap();
        assert_eq!(settings.no_cache, Some(true));
        assert_eq!(settings.env.unwrap()["HOME"], "/home/pkl");
        assert_eq!(
            settings.allowed_modules,
            Some(vec!["file:".to_string(), "pkl:".to_string()])
        );
        assert_eq!(settings.root_dir, None);
        assert_eq!(settings.allowed_resources, None);
    }

    #[test]
    fn dynamic_maps_are_accepted() {
        let mut props = IndexMap::new();
        props.insert("FOO".to_string(), s("bar"));
        let env = Value::Dynamic(DynamicObject {
            properties: props,
            entries: vec![],
            elements: vec![],
        });
        let settings = object("EvaluatorSettings", vec![("env", env)]);
        let settings = ProjectEvaluatorSettings::from_value(&settings).unwrap();
        assert_eq!(settings.env.unwrap()["FOO"], "bar");
    }

    #[test]
    fn missing_project_file_uri_is_an_error() {
        let err = Project::from_value(&object("Project", vec![])).unwrap_err();
        assert!(matches!(err, ProjectError::Missing("projectFileUri")));
    }

    #[test]
    fn wrong_types_are_reported() {
        let value = object("Project", vec![("projectFileUri", Value::Int(3))]);
        let err = Project::from_value(&value).unwrap_err();
        assert_eq!(err.to_string(), "field `projectFileUri`: expected a string");
    }

    #[test]
    fn dependency_encoding() {
        let project = Project::from_value(&sample_project()).unwrap();
        let encoded = project.dependencies.encode();
        insta::assert_json_snapshot!(encoded, @r#"
        {
          "lib": {
            "type": "local",
            "packageUri": "package://example.com/lib@1.0.0",
            "projectFileUri": "file:///work/lib/PklProject",
            "dependencies": {}
          },
          "birds": {
            "type": "remote",
            "packageUri": "package://example.com/birds@0.5.0",
            "checksums": {
              "sha256": "abc123"
            }
          }
        }
        "#);
    }
}
