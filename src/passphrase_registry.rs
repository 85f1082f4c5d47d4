use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Key -> pass phrase mapping, immutable once loaded
#[derive(Debug, Default, PartialEq)]
pub struct PassphraseRegistry {
    phrases: HashMap<String, String>,
}

#[derive(Deserialize)]
struct Passfile {
    passphrases: Phrases,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Phrases {
    /// Keys are derived from the first word of each phrase
    List(Vec<String>),
    Map(HashMap<String, String>),
}

/// The first word of `phrase`; words are separated by anything but alphanumerics and `_`
pub fn key_of(phrase: &str) -> Option<&str> {
    phrase
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .find(|word| !word.is_empty())
}

impl PassphraseRegistry {
    pub fn load(file_path: &Path) -> anyhow::Result<Self> {
        let file = File::open(file_path)?;
        Self::parse(BufReader::new(file))
    }

    fn parse(reader: impl Read) -> anyhow::Result<Self> {
        let passfile: Passfile =
            serde_yaml::from_reader(reader).context("Malformed pass phrase file")?;

        let phrases = match passfile.passphrases {
            Phrases::Map(phrases) => phrases,
            Phrases::List(list) => {
                let mut phrases = HashMap::with_capacity(list.len());
                for phrase in list {
                    let Some(key) = key_of(&phrase) else {
                        bail!("Pass phrase '{}' has no usable first word", phrase);
                    };
                    if phrases.contains_key(key) {
                        bail!("Two pass phrases share the key '{}'", key);
                    }
                    phrases.insert(key.to_string(), phrase);
                }
                phrases
            }
        };

        if phrases.is_empty() {
            log::warn!("No pass phrases configured, every knock will fail");
        }

        Ok(Self { phrases })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.phrases.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }
}

impl FromIterator<(String, String)> for PassphraseRegistry {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            phrases: iter.into_iter().collect(),
        }
    }
}

/// The registry currently in effect, replaced as a whole on reload
pub struct SharedRegistry {
    file_path: PathBuf,
    current: RwLock<Arc<PassphraseRegistry>>,
}

impl SharedRegistry {
    pub fn load(file_path: PathBuf) -> anyhow::Result<Self> {
        let registry = PassphraseRegistry::load(&file_path).with_context(|| {
            format!(
                "Failed to load pass phrase file at '{}'",
                file_path.display()
            )
        })?;
        log::info!("Loaded {} pass phrase(s)", registry.len());

        Ok(Self::with_registry(file_path, registry))
    }

    pub fn with_registry(file_path: PathBuf, registry: PassphraseRegistry) -> Self {
        Self {
            file_path,
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn current(&self) -> Arc<PassphraseRegistry> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-reads the pass phrase file. On failure the previous registry stays in effect.
    pub fn reload(&self) -> anyhow::Result<()> {
        let registry = PassphraseRegistry::load(&self.file_path).with_context(|| {
            format!(
                "Failed to reload pass phrase file at '{}'",
                self.file_path.display()
            )
        })?;
        log::info!("Reloaded {} pass phrase(s)", registry.len());

        let registry = Arc::new(registry);
        match self.current.write() {
            Ok(mut guard) => *guard = registry,
            Err(poisoned) => *poisoned.into_inner() = registry,
        }
        Ok(())
    }
}
