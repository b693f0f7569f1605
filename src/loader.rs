//! Demand class loading from an ordered search path.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::jvm::{read_class_file, JVMParser};
use crate::program::Class;

/// Locates, decodes and caches classes. Each class is parsed at most once;
/// superclasses are loaded recursively before the class that names them.
#[derive(Debug, Default)]
pub struct ClassLoader {
    search_dirs: Vec<PathBuf>,
    table: HashMap<String, Rc<Class>>,
}

impl ClassLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs: dirs,
            table: HashMap::new(),
        }
    }

    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Returns an already-loaded class, if any.
    pub fn get(&self, class_name: &str) -> Option<Rc<Class>> {
        self.table.get(class_name).cloned()
    }

    pub fn is_loaded(&self, class_name: &str) -> bool {
        self.table.contains_key(class_name)
    }

    /// Loads `class_name`, returning the class together with every class
    /// newly loaded by this call in post-order (deepest superclass first).
    /// The caller is expected to run `<clinit>` for the new classes in that
    /// order, which makes a super's initializer precede its subclass's.
    pub fn load(
        &mut self,
        class_name: &str,
    ) -> Result<(Rc<Class>, Vec<Rc<Class>>)> {
        let mut newly_loaded = Vec::new();
        let class = self.load_inner(class_name, &mut newly_loaded)?;
        Ok((class, newly_loaded))
    }

    fn load_inner(
        &mut self,
        class_name: &str,
        newly_loaded: &mut Vec<Rc<Class>>,
    ) -> Result<Rc<Class>> {
        if let Some(class) = self.table.get(class_name) {
            return Ok(class.clone());
        }

        let path = self.find_class_file(class_name)?;
        log::debug!("loading class {class_name} from {}", path.display());
        let bytes = read_class_file(&path)?;
        let class_file = JVMParser::parse(&bytes).map_err(|e| {
            Error::parse(format!("{}: {e}", path.display()))
        })?;
        let class = Rc::new(Class::from_class_file(class_file)?);
        for method in &class.methods {
            log::debug!(
                "  method {}{} code={}B stack={} locals={}",
                method.name,
                method.descriptor,
                method.code.len(),
                method.max_stack,
                method.max_locals
            );
        }

        if let Some(super_name) = class.super_name.clone() {
            if super_name != "java/lang/Object" {
                self.load_inner(&super_name, newly_loaded)?;
            }
        }

        self.table.insert(class_name.to_owned(), class.clone());
        newly_loaded.push(class.clone());
        Ok(class)
    }

    /// Probes every search directory for `class_name + ".class"`, then the
    /// bare filename in the current directory. Dotted names are translated
    /// to their internal slashed form first.
    fn find_class_file(&self, class_name: &str) -> Result<PathBuf> {
        let filename = format!("{}.class", class_name.replace('.', "/"));
        for dir in &self.search_dirs {
            let candidate = dir.join(&filename);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        let fallback = PathBuf::from(&filename);
        if fallback.is_file() {
            return Ok(fallback);
        }
        Err(Error::link(format!(
            "class file not found in search dirs: {filename}"
        )))
    }
}

/// The immediate subdirectories of `dir`, used to extend the search path
/// from the platform classes directory named by `JDK_CLASSES`.
pub fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
    }
    dirs.sort();
    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ClassFileBuilder;
    use crate::jvm::ACC_STATIC;
    use std::fs;

    fn write_class(dir: &Path, builder: &ClassFileBuilder, name: &str) {
        fs::write(dir.join(format!("{name}.class")), builder.build()).unwrap();
    }

    #[test]
    fn loads_and_caches_a_class() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ClassFileBuilder::new("Solo", "java/lang/Object");
        builder.add_method(ACC_STATIC, "f", "()V", 0, 0, vec![0xb1]);
        write_class(dir.path(), &builder, "Solo");

        let mut loader = ClassLoader::with_dirs(vec![dir.path().to_owned()]);
        let (first, newly) = loader.load("Solo").unwrap();
        assert_eq!(first.name, "Solo");
        assert_eq!(newly.len(), 1);

        let (second, newly_again) = loader.load("Solo").unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert!(newly_again.is_empty());
    }

    #[test]
    fn loads_superclasses_deepest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_class(
            dir.path(),
            &ClassFileBuilder::new("A", "java/lang/Object"),
            "A",
        );
        write_class(dir.path(), &ClassFileBuilder::new("B", "A"), "B");
        write_class(dir.path(), &ClassFileBuilder::new("C", "B"), "C");

        let mut loader = ClassLoader::with_dirs(vec![dir.path().to_owned()]);
        let (class, newly) = loader.load("C").unwrap();
        assert_eq!(class.name, "C");
        let names: Vec<&str> =
            newly.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["A", "B", "C"]);

        // Loading a sibling reports only the classes not seen before.
        write_class(dir.path(), &ClassFileBuilder::new("D", "A"), "D");
        let (_, newly) = loader.load("D").unwrap();
        let names: Vec<&str> =
            newly.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["D"]);
    }

    #[test]
    fn probes_search_dirs_in_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let mut shadowed = ClassFileBuilder::new("Dup", "java/lang/Object");
        shadowed.add_method(ACC_STATIC, "marker_first", "()V", 0, 0, vec![0xb1]);
        write_class(first.path(), &shadowed, "Dup");
        write_class(
            second.path(),
            &ClassFileBuilder::new("Dup", "java/lang/Object"),
            "Dup",
        );

        let mut loader = ClassLoader::with_dirs(vec![
            first.path().to_owned(),
            second.path().to_owned(),
        ]);
        let (class, _) = loader.load("Dup").unwrap();
        assert!(class.method("marker_first", "()V").is_some());
    }

    #[test]
    fn missing_class_is_a_link_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = ClassLoader::with_dirs(vec![dir.path().to_owned()]);
        let err = loader.load("Nope").unwrap_err();
        assert!(err.to_string().contains("Nope.class"));
    }

    #[test]
    fn child_dirs_lists_immediate_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("java.base")).unwrap();
        fs::create_dir(dir.path().join("java.logging")).unwrap();
        fs::write(dir.path().join("not-a-dir"), b"x").unwrap();
        let dirs = child_dirs(dir.path());
        assert_eq!(dirs.len(), 2);
    }
}
