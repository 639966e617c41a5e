//! INI config loading and recursive bottom-up brick assembly (spec.md §6,
//! §9). Structurally grounded on `parse_options_from_args`
//! (`src/mnt/mount_options.rs` in the teacher) — comma-split, trim, one
//! token at a time — even though the source format here is INI sections
//! rather than a `-o` option string.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::brick::{Brick, BrickInstance};
use crate::error::KfsError;
use crate::registry::BrickRegistry;
use std::sync::Arc;

const ROOT_SECTION: &str = "brick_root";

/// Loads `config_path`, builds the brick DAG bottom-up starting from the
/// `brick_root` section, and returns the assembled root brick.
///
/// If any section fails to build, every subvolume already built for that
/// section (and transitively, anything built before the failure) is halted
/// in reverse order before the error propagates.
pub fn load_root(config_path: &Path, registry: &BrickRegistry) -> Result<Arc<dyn Brick>, KfsError> {
    let conf = ini::Ini::load_from_file(config_path)?;
    let mut building = HashSet::new();
    let mut built: HashMap<String, BrickInstance> = HashMap::new();
    let root = build_section(&conf, ROOT_SECTION, registry, &mut building, &mut built)?;
    Ok(root.brick)
}

fn build_section(
    conf: &ini::Ini,
    name: &str,
    registry: &BrickRegistry,
    building: &mut HashSet<String>,
    built: &mut HashMap<String, BrickInstance>,
) -> Result<BrickInstance, KfsError> {
    if let Some(existing) = built.get(name) {
        return Ok(existing.clone());
    }
    if !building.insert(name.to_string()) {
        return Err(KfsError::Config(format!(
            "cycle detected while building brick section '{name}'"
        )));
    }

    let section = conf
        .section(Some(name))
        .ok_or_else(|| KfsError::Config(format!("missing section '{name}'")))?;
    let kind = section
        .get("type")
        .ok_or_else(|| KfsError::Config(format!("section '{name}' is missing a 'type' key")))?;

    let sub_names: Vec<String> = section
        .get("subvolumes")
        .map(|s| {
            s.split(',')
                .map(|tok| tok.trim().to_string())
                .filter(|tok| !tok.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut subvols = Vec::with_capacity(sub_names.len());
    for sub_name in &sub_names {
        match build_section(conf, sub_name, registry, building, built) {
            Ok(inst) => subvols.push(inst),
            Err(e) => {
                for inst in subvols.iter().rev() {
                    inst.halt_once();
                }
                building.remove(name);
                return Err(e);
            }
        }
    }
    building.remove(name);

    match registry.construct(kind, section, name, subvols.clone()) {
        Ok(brick) => {
            let inst = BrickInstance::new(brick, name.to_string());
            built.insert(name.to_string(), inst.clone());
            Ok(inst)
        }
        Err(e) => {
            for inst in subvols.iter().rev() {
                inst.halt_once();
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::default_registry;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn loads_a_single_posix_root() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let root_dir = tempfile::tempdir().unwrap();
        writeln!(
            file,
            "[brick_root]\ntype = posix\npath = {}\n",
            root_dir.path().display()
        )
        .unwrap();
        let registry = default_registry();
        let root = load_root(file.path(), &registry).expect("root brick builds");
        let _ = root;
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[brick_root]\ntype = nonexistent\n").unwrap();
        let registry = default_registry();
        let err = load_root(file.path(), &registry).unwrap_err();
        assert!(matches!(err, KfsError::UnsupportedKind(_)));
    }

    #[test]
    fn rejects_cycles() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[brick_root]\ntype = pass\nsubvolumes = a\n\n[a]\ntype = pass\nsubvolumes = brick_root\n"
        )
        .unwrap();
        let registry = default_registry();
        let err = load_root(file.path(), &registry).unwrap_err();
        assert!(matches!(err, KfsError::Config(_)));
    }

    static SHARED_HALT_COUNT: AtomicUsize = AtomicUsize::new(0);

    struct CountingHaltBrick;

    impl Brick for CountingHaltBrick {
        fn halt(&self) {
            SHARED_HALT_COUNT.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_init(
        _section: &ini::Properties,
        _name: &str,
        _subvolumes: Vec<BrickInstance>,
    ) -> Result<Arc<dyn Brick>, KfsError> {
        Ok(Arc::new(CountingHaltBrick))
    }

    #[test]
    fn shared_subvolume_halts_exactly_once() {
        SHARED_HALT_COUNT.store(0, Ordering::SeqCst);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // 'a' and 'b' both mirror the same leaf 's' — a diamond, not a
        // tree. `root.halt()` must still only halt 's' once.
        writeln!(
            file,
            "[brick_root]\ntype = mirror\nsubvolumes = a,b\n\n\
             [a]\ntype = pass\nsubvolumes = s\n\n\
             [b]\ntype = pass\nsubvolumes = s\n\n\
             [s]\ntype = counting\n"
        )
        .unwrap();
        let mut registry = default_registry();
        registry.register("counting", counting_init);
        let root = load_root(file.path(), &registry).expect("diamond-shaped root builds");
        root.halt();
        assert_eq!(SHARED_HALT_COUNT.load(Ordering::SeqCst), 1);
    }
}
