use std::path::PathBuf;

use sample_kit_common::utils::{has_extension, stem_has_postfix, with_postfix_extension};
use tracing::debug;
use walkdir::WalkDir;

use crate::{
    error::{PipelineError, Result},
    hash::sample_key,
    record::{Field, Record, Value},
    traits::{SampleContext, Stage},
    types::Concept,
};

/// Enumerates concept directories and creates one record per accepted image.
///
/// Files whose stem carries the reserved postfix are never treated as images,
/// so mask files living next to their images are skipped.
#[derive(Debug, Clone)]
pub struct CollectPaths {
    pub extensions: Vec<String>,
    pub exclude_postfix: String,
}

impl CollectPaths {
    pub fn new(extensions: Vec<String>, exclude_postfix: impl Into<String>) -> Self {
        Self {
            extensions,
            exclude_postfix: exclude_postfix.into(),
        }
    }

    /// Image paths of one concept in file-name order
    pub fn image_paths(&self, concept: &Concept) -> Result<Vec<PathBuf>> {
        if !concept.path.is_dir() {
            return Err(PipelineError::Config(format!(
                "concept '{}' directory {} does not exist",
                concept.name,
                concept.path.display()
            )));
        }

        let extensions = concept.extensions.as_ref().unwrap_or(&self.extensions);
        let max_depth = if concept.include_subdirectories { usize::MAX } else { 1 };

        let mut paths = Vec::new();
        for entry in WalkDir::new(&concept.path)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map(|p| p.to_path_buf()).unwrap_or_else(|| concept.path.clone());
                PipelineError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if has_extension(path, extensions) && !stem_has_postfix(path, &self.exclude_postfix) {
                paths.push(path.to_path_buf());
            }
        }

        debug!("Concept '{}': {} images", concept.name, paths.len());
        Ok(paths)
    }

    /// Records for every concept, in concept order then file-name order
    pub fn collect(&self, concepts: &[Concept]) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        for concept in concepts {
            for path in self.image_paths(concept)? {
                let mut record = Record::new(sample_key(&concept.name, &path));
                record.insert(Field::ConceptName, Value::Text(concept.name.clone()));
                record.insert(Field::ImagePath, Value::Path(path));
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Derives a sibling path from another path field by postfix and extension
/// substitution. Nothing is checked on disk.
#[derive(Debug, Clone)]
pub struct ModifyPath {
    pub input: Field,
    pub output: Field,
    pub postfix: String,
    pub extension: String,
}

impl ModifyPath {
    pub fn new(input: Field, output: Field, postfix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            input,
            output,
            postfix: postfix.into(),
            extension: extension.into(),
        }
    }
}

impl Stage for ModifyPath {
    fn name(&self) -> &'static str {
        "modify_path"
    }

    fn requires(&self) -> Vec<Field> {
        vec![self.input]
    }

    fn produces(&self) -> Vec<Field> {
        vec![self.output]
    }

    fn apply(&self, record: &mut Record, _ctx: &mut SampleContext<'_>) -> Result<()> {
        let derived = with_postfix_extension(
            record.path(self.name(), self.input)?,
            &self.postfix,
            &self.extension,
        );
        record.insert(self.output, Value::Path(derived));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    fn collector() -> CollectPaths {
        CollectPaths::new(vec![".png".into(), ".jpg".into()], "-masklabel")
    }

    #[test]
    fn test_collect_excludes_masks_and_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.jpg", "a-masklabel.png", "a.txt", "c.PNG", "nested/d.png"] {
            touch(&dir.path().join(name));
        }

        let paths = collector().image_paths(&Concept::new("cat", dir.path())).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png", "c.PNG"]);

        let mut recursive = Concept::new("cat", dir.path());
        recursive.include_subdirectories = true;
        assert_eq!(collector().image_paths(&recursive).unwrap().len(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_mask_is_not_an_image() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join(OsStr::from_bytes(b"caf\xe9.png"));
        touch(&image);
        touch(&dir.path().join(OsStr::from_bytes(b"caf\xe9-masklabel.png")));

        let paths = collector().image_paths(&Concept::new("cat", dir.path())).unwrap();
        assert_eq!(paths, vec![image]);
    }

    #[test]
    fn test_missing_concept_directory_is_fatal() {
        let err = collector()
            .collect(&[Concept::new("ghost", "/definitely/not/here")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(!err.is_sample_local());
    }

    #[test]
    fn test_collect_builds_records() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("one.png"));
        let records = collector().collect(&[Concept::new("cat", dir.path())]).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.text("test", Field::ConceptName).unwrap(), "cat");
        assert_eq!(record.path("test", Field::ImagePath).unwrap(), dir.path().join("one.png"));
        assert_eq!(record.key(), sample_key("cat", &dir.path().join("one.png")));
    }

    #[test]
    fn test_modify_path_is_pure() {
        let context = crate::collaborators::reference_context(4, 8, 16, 256);
        let mut ctx = SampleContext::new(
            crate::hash::sample_rng(0, "k", 0, None),
            0,
            &context,
        );
        let mut record = Record::new("k");
        record.insert(Field::ImagePath, Value::Path("/data/cat/001.png".into()));

        ModifyPath::new(Field::ImagePath, Field::MaskPath, "-masklabel", ".png")
            .apply(&mut record, &mut ctx)
            .unwrap();
        ModifyPath::new(Field::ImagePath, Field::PromptPath, "", ".txt")
            .apply(&mut record, &mut ctx)
            .unwrap();

        assert_eq!(
            record.path("test", Field::MaskPath).unwrap(),
            Path::new("/data/cat/001-masklabel.png")
        );
        assert_eq!(
            record.path("test", Field::PromptPath).unwrap(),
            Path::new("/data/cat/001.txt")
        );
    }
}
