use figment::{
    Error, Metadata, Profile, Provider,
    value::{Dict, Map, Tag, Value},
};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// Wraps a provider so that every `<key>_file` entry also yields `<key>` with
/// the contents of that file. Relative paths resolve against the directory of
/// the config file that named them.
pub struct RecursiveFileProvider<P> {
    inner: P,
}

impl<P> RecursiveFileProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Provider> Provider for RecursiveFileProvider<P> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let data = self.inner.data()?;

        let base_path = self
            .inner
            .metadata()
            .source
            .as_ref()
            .and_then(|s| match s {
                figment::Source::File(path) => path.parent().map(Path::to_path_buf),
                _ => None,
            })
            .unwrap_or_else(|| PathBuf::from("."));

        data.into_iter()
            .map(|(profile, dict)| transform_dict(&base_path, dict).map(|dict| (profile, dict)))
            .collect()
    }

    fn profile(&self) -> Option<Profile> {
        self.inner.profile()
    }
}

fn transform_dict(base_path: &Path, dict: Dict) -> Result<Dict, Error> {
    let mut new_dict = BTreeMap::new();

    for (k, v) in dict {
        let new_v = transform_value(base_path, v)?;

        if let Some(key) = k.strip_suffix("_file") {
            if let Value::String(_, path_str) = &new_v {
                let path = Path::new(path_str);
                let final_path = match path.is_absolute() {
                    true => path.to_path_buf(),
                    false => base_path.join(path),
                };
                let contents = std::fs::read_to_string(&final_path).map_err(|e| {
                    Error::from(format!("Failed to read '{}': {e}", final_path.display()))
                })?;
                // Secrets mounted from files usually end with a newline.
                let contents = contents.trim_end_matches(['\r', '\n']).to_string();
                new_dict.insert(key.to_string(), Value::String(Tag::Default, contents));
            }
        }

        new_dict.insert(k, new_v);
    }

    Ok(new_dict)
}

fn transform_value(base_path: &Path, value: Value) -> Result<Value, Error> {
    match value {
        Value::Dict(tag, dict) => Ok(Value::Dict(tag, transform_dict(base_path, dict)?)),
        Value::Array(tag, arr) => {
            let new_arr: Result<Vec<_>, _> = arr
                .into_iter()
                .map(|v| transform_value(base_path, v))
                .collect();
            Ok(Value::Array(tag, new_arr?))
        }
        other => Ok(other),
    }
}
