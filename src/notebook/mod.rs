//! Notebook templates: ordered units with kind, source and tags.

use std::{collections::BTreeSet, fs, path::Path};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Tag marking the unit that receives injected inputs.
pub const PARAMETERS_TAG: &str = "parameters";
/// Tag added to the unit after injection.
pub const INJECTED_TAG: &str = "injected-parameters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Code,
    Doc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub kind: UnitKind,
    pub source: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Unit {
    pub fn code(source: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Code,
            source: source.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn doc(source: impl Into<String>) -> Self {
        Self {
            kind: UnitKind::Doc,
            source: source.into(),
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn is_code(&self) -> bool {
        self.kind == UnitKind::Code
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub units: Vec<Unit>,
    /// Kernel named by the document's metadata, if any.
    #[serde(default)]
    pub kernel_name: Option<String>,
}

impl Notebook {
    pub fn new(units: Vec<Unit>) -> Self {
        Self {
            units,
            kernel_name: None,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Indices of units carrying `tag`.
    pub fn tagged(&self, tag: &str) -> Vec<usize> {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.has_tag(tag))
            .map(|(i, _)| i)
            .collect()
    }

    /// Read an nbformat v4 JSON document.
    pub fn from_ipynb_str(text: &str) -> Result<Self> {
        let doc: IpynbDocument = serde_json::from_str(text).context("parsing notebook json")?;
        if doc.nbformat != 4 {
            bail!("unsupported nbformat version {}", doc.nbformat);
        }
        let units = doc
            .cells
            .into_iter()
            .map(|cell| Unit {
                kind: if cell.cell_type == "code" {
                    UnitKind::Code
                } else {
                    UnitKind::Doc
                },
                source: cell.source.into_text(),
                tags: cell.metadata.tags.into_iter().collect(),
            })
            .collect();
        Ok(Self {
            units,
            kernel_name: doc.metadata.kernelspec.map(|k| k.name),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading notebook: {}", path.display()))?;
        Self::from_ipynb_str(&text).with_context(|| format!("in {}", path.display()))
    }
}

#[derive(Deserialize)]
struct IpynbDocument {
    nbformat: u32,
    #[serde(default)]
    metadata: IpynbMetadata,
    #[serde(default)]
    cells: Vec<IpynbCell>,
}

#[derive(Deserialize, Default)]
struct IpynbMetadata {
    #[serde(default)]
    kernelspec: Option<IpynbKernelspec>,
}

#[derive(Deserialize)]
struct IpynbKernelspec {
    name: String,
}

#[derive(Deserialize)]
struct IpynbCell {
    cell_type: String,
    #[serde(default)]
    source: MultilineText,
    #[serde(default)]
    metadata: IpynbCellMetadata,
}

#[derive(Deserialize, Default)]
struct IpynbCellMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

/// nbformat stores text either as one string or as a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum MultilineText {
    One(String),
    Lines(Vec<String>),
}

impl Default for MultilineText {
    fn default() -> Self {
        MultilineText::One(String::new())
    }
}

impl MultilineText {
    fn into_text(self) -> String {
        match self {
            MultilineText::One(s) => s,
            MultilineText::Lines(lines) => lines.concat(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r##"{
      "nbformat": 4,
      "nbformat_minor": 5,
      "metadata": {"kernelspec": {"name": "python3", "display_name": "Python 3", "language": "python"}},
      "cells": [
        {"cell_type": "markdown", "metadata": {}, "source": ["# SAMPLE NOTEBOOK\n", "text"]},
        {"cell_type": "code", "metadata": {"tags": ["parameters"]}, "source": "foo = \"foo\"\nbar = 500\n", "outputs": [], "execution_count": null},
        {"cell_type": "code", "metadata": {}, "source": ["print(foo)"], "outputs": [], "execution_count": null}
      ]
    }"##;

    #[test]
    fn reads_ipynb_cells_and_tags() {
        let nb = Notebook::from_ipynb_str(SAMPLE).unwrap();
        assert_eq!(nb.len(), 3);
        assert_eq!(nb.kernel_name.as_deref(), Some("python3"));
        assert_eq!(nb.units[0].kind, UnitKind::Doc);
        assert_eq!(nb.units[0].source, "# SAMPLE NOTEBOOK\ntext");
        assert_eq!(nb.tagged(PARAMETERS_TAG), vec![1]);
        assert_eq!(nb.units[2].source, "print(foo)");
    }

    #[test]
    fn rejects_old_nbformat() {
        let err = Notebook::from_ipynb_str(r#"{"nbformat": 3, "cells": []}"#).unwrap_err();
        assert!(err.to_string().contains("nbformat"));
    }
}
