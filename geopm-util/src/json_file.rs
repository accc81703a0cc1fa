// Copyright (c) GEOPM experiment developers.
// SPDX-License-Identifier: BSD-3-Clause
use anyhow::{Context, Result};
use log::info;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::prelude::*;
use std::path::{Path, PathBuf};

// Leading "//" and "#" lines are the preamble. Comment lines in the body
// are blanked so that serde_json error positions still match the file.
fn split_preamble(buf: &str) -> (String, String) {
    let mut preamble = String::new();
    let mut body = String::new();
    let mut in_body = false;

    for line in buf.lines() {
        let trimmed = line.trim_start();
        let is_comment = trimmed.starts_with("//") || trimmed.starts_with('#');
        if is_comment {
            if !in_body {
                preamble.push_str(line);
                preamble.push('\n');
            }
            body.push('\n');
        } else {
            in_body = true;
            body.push_str(line);
            body.push('\n');
        }
    }
    (preamble, body)
}

fn read_json<P: AsRef<Path>>(path: P) -> Result<(String, String)> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path).with_context(|| format!("Reading {:?}", path))?;
    Ok(split_preamble(&buf))
}

fn write_whole<P: AsRef<Path>>(path: P, contents: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;
    f.write_all(contents.as_bytes())?;
    f.flush()?;
    Ok(())
}

pub trait JsonLoad
where
    Self: DeserializeOwned,
{
    fn loaded(&mut self) -> Result<()> {
        Ok(())
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (_, body) = read_json(&path)?;
        let mut data = serde_json::from_str::<Self>(&body)
            .with_context(|| format!("Parsing {:?}", path.as_ref()))?;
        data.loaded()?;
        Ok(data)
    }
}

pub trait JsonSave
where
    Self: Serialize,
{
    fn preamble() -> Option<String> {
        None
    }

    fn as_json(&self) -> Result<String> {
        let mut serialized = serde_json::to_string_pretty(&self)?;
        if !serialized.ends_with('\n') {
            serialized.push('\n');
        }
        Ok(match Self::preamble() {
            Some(pre) => pre + &serialized,
            None => serialized,
        })
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_whole(&path, &self.as_json()?)
            .with_context(|| format!("Writing {:?}", path.as_ref()))
    }

    /// Write to `PATH.staging` and rename over `PATH` so that readers never
    /// observe a partially written file.
    fn save_atomic<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut staging = path.as_os_str().to_owned();
        staging.push(".staging");
        let staging = PathBuf::from(staging);

        self.save(&staging)?;
        fs::rename(&staging, path)
            .with_context(|| format!("Renaming {:?} to {:?}", &staging, path))?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct JsonConfigFile<T: JsonLoad + JsonSave> {
    pub path: Option<PathBuf>,
    pub data: T,
}

impl<T: JsonLoad + JsonSave + Default> JsonConfigFile<T> {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            path: Some(PathBuf::from(path.as_ref())),
            data: T::load(&path)?,
        })
    }

    pub fn load_or_create<P: AsRef<Path>>(path_opt: Option<P>) -> Result<Self> {
        let path = match path_opt {
            Some(v) => PathBuf::from(v.as_ref()),
            None => {
                let mut data = T::default();
                data.loaded()?;
                return Ok(Self { path: None, data });
            }
        };

        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            T::default().save(&path)?;
            info!("cfg: Created {:?}", &path);
        }
        Self::load(&path)
    }

    pub fn save(&self) -> Result<()> {
        match self.path.as_ref() {
            Some(path) => self.data.save(path),
            None => Ok(()),
        }
    }
}

pub trait JsonArgs
where
    Self: JsonLoad + JsonSave + Default,
{
    fn match_cmdline() -> clap::ArgMatches<'static>;
    fn verbosity(matches: &clap::ArgMatches) -> u32;
    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool>;
}

pub trait JsonArgsHelper
where
    Self: JsonArgs,
{
    fn init_args_and_logging() -> Result<JsonConfigFile<Self>>;
}

impl<T> JsonArgsHelper for T
where
    T: JsonArgs,
{
    fn init_args_and_logging() -> Result<JsonConfigFile<T>> {
        let matches = T::match_cmdline();
        super::init_logging(T::verbosity(&matches));

        let mut args_file = JsonConfigFile::<T>::load_or_create(matches.value_of("args"))?;
        if args_file.data.process_cmdline(&matches)? && args_file.path.is_some() {
            info!("Updating command line arguments file {:?}", &args_file.path);
            args_file.save()?;
        }
        Ok(args_file)
    }
}

/// Untyped JSON document which keeps its comment preamble across a
/// load/modify/save cycle.
pub struct JsonRawFile {
    pub path: PathBuf,
    pub preamble: String,
    pub value: serde_json::Value,
}

impl JsonRawFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (preamble, body) = read_json(&path)?;
        Ok(Self {
            path: PathBuf::from(path.as_ref()),
            preamble,
            value: serde_json::from_str(&body)
                .with_context(|| format!("Parsing {:?}", path.as_ref()))?,
        })
    }

    pub fn save(&self) -> Result<()> {
        let mut output = self.preamble.clone() + &serde_json::to_string_pretty(&self.value)?;
        output.push('\n');
        write_whole(&self.path, &output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default, Debug, PartialEq, Serialize, Deserialize)]
    struct Knobs {
        name: String,
        value: f64,
    }

    impl JsonLoad for Knobs {}
    impl JsonSave for Knobs {
        fn preamble() -> Option<String> {
            Some("// test knobs\n".into())
        }
    }

    #[test]
    fn test_split_preamble() {
        let (pre, body) = split_preamble("// one\n# two\n{\n  // inner\n  \"a\": 1\n}\n");
        assert_eq!(pre, "// one\n# two\n");
        assert_eq!(body, "\n\n{\n\n  \"a\": 1\n}\n");
    }

    #[test]
    fn test_save_atomic_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("knobs.json");
        let knobs = Knobs {
            name: "x".into(),
            value: 1.5,
        };
        knobs.save_atomic(&path).unwrap();
        assert!(!dir.path().join("knobs.json.staging").exists());
        assert!(fs::read_to_string(&path).unwrap().starts_with("// test knobs\n"));
        assert_eq!(Knobs::load(&path).unwrap(), knobs);
    }

    #[test]
    fn test_raw_file_keeps_preamble() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("raw.json");
        fs::write(&path, "# header\n{\"a\": 1}\n").unwrap();

        let mut raw = JsonRawFile::load(&path).unwrap();
        raw.value["b"] = serde_json::json!(2);
        raw.save().unwrap();

        let reloaded = JsonRawFile::load(&path).unwrap();
        assert_eq!(reloaded.preamble, "# header\n");
        assert_eq!(reloaded.value["a"], 1);
        assert_eq!(reloaded.value["b"], 2);
    }
}
