//! End-to-end tests assembling bricks the way `config::load_root` does,
//! exercising stacks that no single module's own unit tests cover: a
//! mirror of two POSIX roots wrapped in a cache, loaded straight from an
//! INI file.

use std::io::Write;
use std::path::Path;

use kennyfs::context::Context;
use kennyfs::registry::default_registry;
use kennyfs::types::FileKind;

fn write_conf(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn cache_over_mirror_of_two_posix_roots_round_trips() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let conf = write_conf(&format!(
        "[brick_root]\ntype = cache\nsubvolumes = replicas,cache\n\n\
         [replicas]\ntype = mirror\nsubvolumes = a,b\n\n\
         [a]\ntype = posix\npath = {}\n\n\
         [b]\ntype = posix\npath = {}\n\n\
         [cache]\ntype = posix\npath = {}\n",
        a.path().display(),
        b.path().display(),
        cache.path().display(),
    ));

    let registry = default_registry();
    let root = kennyfs::config::load_root(conf.path(), &registry).expect("root brick builds");
    let ctx = Context::new(0, 0, 0);

    let attr = root.mkdir(&ctx, Path::new("/d"), 0o755).unwrap();
    assert_eq!(attr.kind, FileKind::Directory);
    assert!(a.path().join("d").is_dir());
    assert!(b.path().join("d").is_dir());

    let fh = root.create(&ctx, Path::new("/d/f"), 0o644, libc::O_RDWR).unwrap().0;
    let n = root.write(&ctx, Path::new("/d/f"), fh, 0, b"hello").unwrap();
    assert_eq!(n, 5);
    root.release(&ctx, Path::new("/d/f"), fh).unwrap();

    assert_eq!(std::fs::read(a.path().join("d/f")).unwrap(), b"hello");
    assert_eq!(std::fs::read(b.path().join("d/f")).unwrap(), b"hello");

    // getattr should now be served through the cache brick's shell node.
    let stat = root.getattr(&ctx, Path::new("/d/f")).unwrap();
    assert_eq!(stat.size, 5);

    root.halt();
}

#[test]
fn mirror_ejects_a_later_subvolume_that_fails_a_destructive_op() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    std::fs::write(a.path().join("f"), b"x").unwrap();
    // b has no such file: its unlink will fail, but it's not the first
    // (canonical) subvolume, so the mirror ejects it and still reports
    // overall success rather than aborting the whole call.
    let conf = write_conf(&format!(
        "[brick_root]\ntype = mirror\nsubvolumes = a,b\n\n\
         [a]\ntype = posix\npath = {}\n\n\
         [b]\ntype = posix\npath = {}\n",
        a.path().display(),
        b.path().display(),
    ));

    let registry = default_registry();
    let root = kennyfs::config::load_root(conf.path(), &registry).expect("root brick builds");
    let ctx = Context::new(0, 0, 0);

    root.unlink(&ctx, Path::new("/f")).expect("eject-and-continue keeps the overall call Ok");
    assert!(!a.path().join("f").exists());

    root.halt();
}
