use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use filetime::{set_file_mtime, FileTime};
use pretty_assertions::assert_eq;
use strata_cache::{
    BoxRead, BoxWrite, CacheConfig, CacheEngine, CacheError, CacheStrategy, ConcreteResource,
    EventError, FileEvent, FileEventEmitter, Location, OpenMode, Transfer, TransferDecorator,
    ATTR_ALT_STORAGE_PATH, ATTR_FAST_STORAGE_PATH, ATTR_TIMEOUT_SECONDS,
};
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

/// Collects formatted log output from a scoped subscriber.
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

struct LogBufferWriter(Arc<Mutex<Vec<u8>>>);

impl Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter(Arc::clone(&self.0))
    }
}

impl LogBuffer {
    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(self.clone())
            .finish()
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

struct Fixture {
    tmp: TempDir,
    engine: CacheEngine,
}

impl Fixture {
    fn new(strategy: CacheStrategy) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let engine =
            CacheEngine::new(CacheConfig::new(tmp.path().join("main")).with_strategy(strategy));
        Self { tmp, engine }
    }

    fn fast_dir(&self) -> PathBuf {
        self.tmp.path().join("fast")
    }

    fn location(&self, fast: bool) -> Arc<Location> {
        let location = Location::new("central").with_uri("https://repo.example.org/maven2");
        if fast {
            location.set_fast_storage_path(self.fast_dir().to_string_lossy());
        }
        Arc::new(location)
    }
}

fn resource(location: &Arc<Location>, path: &str) -> ConcreteResource {
    ConcreteResource::new(Arc::clone(location), path).unwrap()
}

fn write(engine: &CacheEngine, res: &ConcreteResource, bytes: &[u8]) {
    let mut writer = engine.open_output_stream(res).unwrap();
    writer.write_all(bytes).unwrap();
    writer.commit().unwrap();
}

fn read(engine: &CacheEngine, res: &ConcreteResource) -> Vec<u8> {
    let mut reader = engine.open_input_stream(res).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    reader.close().unwrap();
    out
}

fn age(path: &Path, by: Duration) {
    set_file_mtime(path, FileTime::from_system_time(SystemTime::now() - by)).unwrap();
}

#[test]
fn round_trip_without_fast_tier() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(false);
    let res = resource(&loc, "org/foo/foo/1.0/foo-1.0.pom");

    write(&fx.engine, &res, b"<project/>");

    assert!(fx.engine.exists(&res));
    assert!(fx.engine.is_file(&res));
    assert_eq!(fx.engine.length(&res), 10);
    assert!(fx.engine.last_modified(&res).is_some());
    assert_eq!(read(&fx.engine, &res), b"<project/>");
    assert_eq!(
        fx.engine.file_path(&res),
        fx.tmp.path().join("main/central/org/foo/foo/1.0/foo-1.0.pom")
    );
}

#[test]
fn round_trip_with_fast_tier_writes_both_tiers() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let res = resource(&loc, "org/foo/foo-1.0.jar");
    let body: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    write(&fx.engine, &res, &body);

    let fast = fx.fast_dir().join("org/foo/foo-1.0.jar");
    assert_eq!(fs::read(&fast).unwrap(), body);
    assert_eq!(fs::read(fx.engine.file_path(&res)).unwrap(), body);

    let mut reader = fx.engine.open_input_stream(&res).unwrap();
    assert_eq!(reader.path(), fast.as_path());
    assert!(!reader.is_promoting());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert_eq!(out, body);
}

#[test]
fn cold_read_promotes_to_fast_tier() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let res = resource(&loc, "org/foo/foo-1.0.jar");
    let main = fx.engine.file_path(&res);
    fs::create_dir_all(main.parent().unwrap()).unwrap();
    fs::write(&main, b"jar bytes").unwrap();

    let fast = fx.fast_dir().join("org/foo/foo-1.0.jar");
    assert!(!fast.exists());

    let mut reader = fx.engine.open_input_stream(&res).unwrap();
    assert!(reader.is_promoting());
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    reader.close().unwrap();

    assert_eq!(out, b"jar bytes");
    assert_eq!(fs::read(&fast).unwrap(), b"jar bytes");
    assert!(!fx.engine.get_transfer(&res).is_promoting());
}

#[test]
fn concurrent_cold_readers_share_one_promotion() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let res = resource(&loc, "a.jar");
    let main = fx.engine.file_path(&res);
    fs::create_dir_all(main.parent().unwrap()).unwrap();
    fs::write(&main, b"abc").unwrap();

    let first = fx.engine.open_input_stream(&res).unwrap();
    let second = fx.engine.open_input_stream(&res).unwrap();
    assert!(first.is_promoting());
    assert!(!second.is_promoting());

    for mut reader in [first, second] {
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "abc");
        reader.close().unwrap();
    }
    assert_eq!(fs::read(fx.fast_dir().join("a.jar")).unwrap(), b"abc");
}

#[test]
fn failed_promotion_is_invisible_to_the_reader() {
    let fx = Fixture::new(CacheStrategy::Simple);
    // A regular file where the fast tier's directory should be.
    fs::write(fx.fast_dir(), b"").unwrap();
    let fast_root = fx.fast_dir().join("tier");
    let loc = Arc::new(
        Location::new("central").with_attribute(ATTR_FAST_STORAGE_PATH, fast_root.to_string_lossy()),
    );
    let res = resource(&loc, "a.jar");
    let main = fx.engine.file_path(&res);
    fs::create_dir_all(main.parent().unwrap()).unwrap();
    fs::write(&main, b"abc").unwrap();

    assert_eq!(read(&fx.engine, &res), b"abc");
    assert!(!fast_root.join("a.jar").exists());
}

#[test]
fn opening_a_missing_resource_is_not_found() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let err = fx
        .engine
        .open_input_stream(&resource(&loc, "missing.pom"))
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound { .. }), "{err}");
    assert!(err.is_not_found());
}

#[test]
fn alt_storage_overrides_the_main_tier_root() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let alt = fx.tmp.path().join("alt");
    let loc = Arc::new(
        Location::new("local").with_attribute(ATTR_ALT_STORAGE_PATH, alt.to_string_lossy()),
    );
    let res = resource(&loc, "x/y.txt");

    write(&fx.engine, &res, b"y");
    assert_eq!(fs::read(alt.join("x/y.txt")).unwrap(), b"y");
    assert!(!fx.engine.file_path(&res).exists());
}

#[test]
fn listing_filters_hidden_and_in_flight_entries() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(false);
    let dir = resource(&loc, "org/foo");
    assert_eq!(fx.engine.list(&dir), None);

    fx.engine.mkdirs(&dir).unwrap();
    let main = fx.engine.file_path(&dir);
    fs::write(main.join("a.txt"), b"a").unwrap();
    fs::write(main.join(".hidden"), b"h").unwrap();
    fs::write(main.join("a.txt.to-write"), b"partial").unwrap();
    fs::write(main.join("b.txt.to-delete"), b"gone").unwrap();

    assert_eq!(fx.engine.list(&dir), Some(vec!["a.txt".to_owned()]));
    assert!(fx.engine.is_directory(&dir));
    // A file is not listable.
    assert_eq!(fx.engine.list(&resource(&loc, "org/foo/a.txt")), None);
}

#[test]
fn alias_copies_content_and_same_resource_is_a_no_op() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(false);
    let from = resource(&loc, "org/foo/maven-metadata-central.xml");
    let to = resource(&loc, "org/foo/maven-metadata.xml");
    write(&fx.engine, &from, b"<metadata/>");

    fx.engine.create_alias(&from, &to).unwrap();
    assert_eq!(read(&fx.engine, &to), b"<metadata/>");

    let path = fx.engine.file_path(&from);
    let before = SystemTime::now() - Duration::from_secs(600);
    set_file_mtime(&path, FileTime::from_system_time(before)).unwrap();
    fx.engine.create_alias(&from, &from.clone()).unwrap();
    assert_eq!(
        FileTime::from_last_modification_time(&fs::metadata(&path).unwrap()),
        FileTime::from_system_time(before)
    );
}

#[test]
fn copy_requires_a_main_tier_source_and_mirrors_fast_copies() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let from = resource(&loc, "a.jar");
    let to = resource(&loc, "b.jar");

    let err = fx.engine.copy(&from, &to).unwrap_err();
    assert!(matches!(err, CacheError::CopySourceMissing { .. }), "{err}");
    assert!(err.to_string().contains("a.jar"), "{err}");

    write(&fx.engine, &from, b"bytes");
    fx.engine.copy(&from, &to).unwrap();
    assert_eq!(fs::read(fx.engine.file_path(&to)).unwrap(), b"bytes");
    assert_eq!(fs::read(fx.fast_dir().join("b.jar")).unwrap(), b"bytes");
}

#[derive(Default, Clone)]
struct Recorder(Arc<Mutex<Vec<FileEvent>>>);

impl Recorder {
    fn take(&self) -> Vec<FileEvent> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl FileEventEmitter for Recorder {
    fn fire(&self, event: &FileEvent) -> Result<(), EventError> {
        self.0.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[test]
fn delete_removes_both_tiers_and_reports_main_result() {
    let tmp = tempfile::tempdir().unwrap();
    let events = Recorder::default();
    let engine = CacheEngine::builder(CacheConfig::new(tmp.path().join("main")))
        .event_emitter(events.clone())
        .build();
    let loc = Arc::new(Location::new("central").with_attribute(
        ATTR_FAST_STORAGE_PATH,
        tmp.path().join("fast").to_string_lossy(),
    ));
    let res = resource(&loc, "a.jar");
    write(&engine, &res, b"abc");
    events.take();

    assert!(engine.delete(&res).unwrap());
    assert!(!engine.exists(&res));
    assert!(!tmp.path().join("fast/a.jar").exists());
    assert_eq!(events.take(), vec![FileEvent::Deleted { resource: res.clone() }]);

    assert!(!engine.delete(&res).unwrap());
    assert!(events.take().is_empty());
}

#[test]
fn streams_report_open_and_close() {
    let tmp = tempfile::tempdir().unwrap();
    let events = Recorder::default();
    let engine = CacheEngine::builder(CacheConfig::new(tmp.path()))
        .event_emitter(events.clone())
        .build();
    let res = resource(&Arc::new(Location::new("central")), "a.txt");

    write(&engine, &res, b"a");
    read(&engine, &res);

    assert_eq!(
        events.take(),
        vec![
            FileEvent::Opened { resource: res.clone(), mode: OpenMode::Write },
            FileEvent::Closed { resource: res.clone(), mode: OpenMode::Write },
            FileEvent::Opened { resource: res.clone(), mode: OpenMode::Read },
            FileEvent::Closed { resource: res.clone(), mode: OpenMode::Read },
        ]
    );
}

#[test]
fn expired_files_disappear_on_lookup() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = Arc::new(Location::new("central").with_attribute(ATTR_TIMEOUT_SECONDS, "3600"));
    let stale = resource(&loc, "stale.pom");
    let fresh = resource(&loc, "fresh.pom");
    write(&fx.engine, &stale, b"old");
    write(&fx.engine, &fresh, b"new");
    age(&fx.engine.file_path(&stale), Duration::from_secs(3601));
    age(&fx.engine.file_path(&fresh), Duration::from_secs(3599));

    assert!(!fx.engine.exists(&stale));
    assert!(!fx.engine.file_path(&stale).exists());
    assert!(fx.engine.exists(&fresh));
}

#[test]
fn timeout_processing_can_be_switched_off() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        timeout_processing: false,
        ..CacheConfig::new(tmp.path())
    };
    let engine = CacheEngine::new(config);
    let loc = Arc::new(Location::new("central").with_attribute(ATTR_TIMEOUT_SECONDS, "3600"));
    let res = resource(&loc, "stale.pom");
    write(&engine, &res, b"old");
    age(&engine.file_path(&res), Duration::from_secs(10 * 3600));

    assert!(engine.exists(&res));
}

#[test]
fn mkdirs_and_create_file_tolerate_a_broken_fast_tier() {
    let fx = Fixture::new(CacheStrategy::Simple);
    fs::write(fx.fast_dir(), b"not a directory").unwrap();
    let loc = fx.location(true);

    let dir = resource(&loc, "org/foo");
    fx.engine.mkdirs(&dir).unwrap();
    assert!(fx.engine.file_path(&dir).is_dir());

    let file = resource(&loc, "org/foo/empty.txt");
    fx.engine.create_file(&file).unwrap();
    assert!(fx.engine.file_path(&file).is_file());
    assert_eq!(fx.engine.length(&file), 0);

    // A fresh write still lands in main even though the fast copy cannot be made.
    write(&fx.engine, &file, b"content");
    assert_eq!(read(&fx.engine, &file), b"content");
}

#[test]
fn aborted_writes_keep_previous_content() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let res = resource(&loc, "a.jar");
    write(&fx.engine, &res, b"v1");

    let mut writer = fx.engine.open_output_stream(&res).unwrap();
    writer.write_all(b"v2 but trunc").unwrap();
    writer.abort();

    assert_eq!(read(&fx.engine, &res), b"v1");
    assert_eq!(fx.engine.list(&ConcreteResource::root(loc)), Some(vec!["a.jar".to_owned()]));
}

/// Yields `remaining` bytes, then fails like a dropped connection.
struct BrokenUpstream {
    remaining: usize,
}

impl Read for BrokenUpstream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let n = self.remaining.min(buf.len());
        buf[..n].fill(b'!');
        self.remaining -= n;
        Ok(n)
    }
}

fn fetch(engine: &CacheEngine, res: &ConcreteResource) -> Result<(), CacheError> {
    let mut writer = engine.open_output_stream(res)?;
    io::copy(&mut BrokenUpstream { remaining: 7 }, &mut writer)?;
    writer.commit()
}

#[test]
fn failed_fetch_publishes_nothing() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let fresh = resource(&loc, "org/foo/foo-1.0.jar");

    let logs = LogBuffer::default();
    let err = tracing::subscriber::with_default(logs.subscriber(), || {
        fetch(&fx.engine, &fresh).unwrap_err()
    });
    assert!(matches!(err, CacheError::Io(_)), "{err}");
    assert!(!fx.engine.exists(&fresh));
    assert!(!fx.engine.file_path(&fresh).exists());
    assert!(!fx.fast_dir().join("org/foo/foo-1.0.jar").exists());
    for dir in [
        fx.engine.file_path(&resource(&loc, "org/foo")),
        fx.fast_dir().join("org/foo"),
    ] {
        let leftovers: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(leftovers.is_empty(), "{}: {leftovers:?}", dir.display());
    }
    let text = logs.contents();
    assert!(text.contains("dropped without commit"), "{text}");

    // A failed refresh keeps the previous content on both tiers.
    let existing = resource(&loc, "a.jar");
    write(&fx.engine, &existing, b"v1");
    fetch(&fx.engine, &existing).unwrap_err();
    assert_eq!(read(&fx.engine, &existing), b"v1");
    assert_eq!(fs::read(fx.engine.file_path(&existing)).unwrap(), b"v1");
}

#[test]
fn transfer_streams_publish_only_on_commit() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let transfer = fx.engine.get_transfer(&resource(&loc, "org/foo/foo-1.0.pom"));

    {
        let mut out = transfer.open_output_stream().unwrap();
        out.write_all(b"half").unwrap();
    }
    assert!(!transfer.exists().unwrap());
    assert!(!fx.engine.file_path(transfer.resource()).exists());

    let out = transfer.open_output_stream().unwrap();
    out.abort();
    assert!(!transfer.exists().unwrap());

    let mut out = transfer.open_output_stream().unwrap();
    out.write_all(b"<project/>").unwrap();
    out.commit().unwrap();
    assert_eq!(transfer.length().unwrap(), 10);
}

#[test]
fn detached_file_promotes_and_creates_roots() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);

    let dir = resource(&loc, "org/foo");
    fx.engine.mkdirs(&resource(&loc, "org/foo/1.0")).unwrap();
    let main_dir = fx.engine.file_path(&dir);
    fs::write(main_dir.join("1.0/foo-1.0.pom"), b"<project/>").unwrap();
    fs::remove_dir_all(fx.fast_dir()).unwrap();

    let detached = fx.engine.detached_file(&dir).unwrap();
    assert_eq!(detached, fx.fast_dir().join("org/foo"));
    assert_eq!(fs::read(detached.join("1.0/foo-1.0.pom")).unwrap(), b"<project/>");

    let root = ConcreteResource::root(Arc::new(Location::new("empty")));
    let root_dir = fx.engine.detached_file(&root).unwrap();
    assert!(root_dir.is_dir());
    assert_eq!(root_dir, fx.tmp.path().join("main/empty"));

    let missing = resource(&loc, "nope.txt");
    assert_eq!(fx.engine.detached_file(&missing).unwrap(), fx.engine.file_path(&missing));
}

#[test]
fn concurrent_lookups_yield_one_transfer() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(false);
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let engine = fx.engine.clone();
            let loc = Arc::clone(&loc);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.get_transfer(&resource(&loc, "org/foo/foo-1.0.pom"))
            })
        })
        .collect();
    let transfers: Vec<Arc<Transfer>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(transfers.iter().all(|t| Arc::ptr_eq(t, &transfers[0])));
    assert_eq!(fx.engine.transfer_count(), 1);

    fx.engine.clear_transfer_cache();
    assert_eq!(fx.engine.transfer_count(), 0);
    let fresh = fx.engine.get_transfer(&resource(&loc, "org/foo/foo-1.0.pom"));
    assert!(!Arc::ptr_eq(&fresh, &transfers[0]));
}

#[test]
fn transfers_operate_through_their_engine() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let loc = fx.location(true);
    let dir = fx.engine.get_transfer(&ConcreteResource::root(Arc::clone(&loc)));
    let pom = dir.child("org/foo/foo-1.0.pom").unwrap();

    assert!(!pom.exists().unwrap());
    let mut out = pom.open_output_stream().unwrap();
    out.write_all(b"<project/>").unwrap();
    assert!(!pom.exists().unwrap());
    out.commit().unwrap();
    assert!(pom.exists().unwrap());
    assert!(pom.is_file().unwrap());
    assert_eq!(pom.length().unwrap(), 10);

    let mut text = String::new();
    pom.open_input_stream().unwrap().read_to_string(&mut text).unwrap();
    assert_eq!(text, "<project/>");

    let parent = pom.parent().unwrap().unwrap();
    assert_eq!(parent.path(), "org/foo");
    assert_eq!(parent.list().unwrap(), Some(vec!["foo-1.0.pom".to_owned()]));

    let alias = parent.child("foo.pom").unwrap();
    pom.create_alias_to(&alias).unwrap();
    assert_eq!(alias.length().unwrap(), 10);

    assert!(pom.delete().unwrap());
    assert!(!pom.exists().unwrap());
}

#[test]
fn transfers_outliving_the_engine_fail_cleanly() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let transfer = fx.engine.get_transfer(&resource(&fx.location(false), "a.txt"));
    drop(fx.engine);
    let err = transfer.exists().unwrap_err();
    assert!(matches!(err, CacheError::EngineDropped { .. }), "{err}");
}

struct Counting(Arc<AtomicUsize>);

impl TransferDecorator for Counting {
    fn decorate_read(&self, stream: BoxRead, _transfer: &Transfer) -> io::Result<BoxRead> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }

    fn decorate_write(&self, stream: BoxWrite, _transfer: &Transfer) -> io::Result<BoxWrite> {
        self.0.fetch_add(10, Ordering::SeqCst);
        Ok(stream)
    }
}

/// Appends a trailer when the decorated stream is closed.
struct Trailer;

struct TrailerWriter(BoxWrite);

impl Write for TrailerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Drop for TrailerWriter {
    fn drop(&mut self) {
        let _ = self.0.write_all(b"\n<!-- end -->");
    }
}

impl TransferDecorator for Trailer {
    fn decorate_write(&self, stream: BoxWrite, _transfer: &Transfer) -> io::Result<BoxWrite> {
        Ok(Box::new(TrailerWriter(stream)))
    }
}

#[test]
fn commit_closes_the_decorated_stream_first() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = CacheEngine::builder(CacheConfig::new(tmp.path()))
        .decorator(Trailer)
        .build();
    let transfer = engine.get_transfer(&resource(&Arc::new(Location::new("central")), "a.pom"));

    let mut out = transfer.open_output_stream().unwrap();
    out.write_all(b"<project/>").unwrap();
    out.commit().unwrap();

    assert_eq!(read(&engine, transfer.resource()), b"<project/>\n<!-- end -->");
}

#[test]
fn transfer_streams_pass_through_the_decorator() {
    let tmp = tempfile::tempdir().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let engine = CacheEngine::builder(CacheConfig::new(tmp.path()))
        .decorator(Counting(Arc::clone(&count)))
        .build();
    let transfer = engine.get_transfer(&resource(&Arc::new(Location::new("central")), "a.txt"));

    let mut writer = transfer.open_output_stream().unwrap();
    writer.write_all(b"x").unwrap();
    writer.commit().unwrap();
    let mut out = Vec::new();
    transfer.open_input_stream().unwrap().read_to_end(&mut out).unwrap();

    assert_eq!(out, b"x");
    assert_eq!(count.load(Ordering::SeqCst), 11);
    // Engine-level streams are not decorated.
    read(&engine, transfer.resource());
    assert_eq!(count.load(Ordering::SeqCst), 11);
}

#[test]
fn joinable_strategy_tracks_open_streams() {
    let fx = Fixture::new(CacheStrategy::Joinable);
    let loc = fx.location(false);
    let res = resource(&loc, "a.jar");

    let writer = fx.engine.open_output_stream(&res).unwrap();
    assert!(fx.engine.is_write_locked(&res));
    assert!(!fx.engine.is_read_locked(&res));

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let engine = fx.engine.clone();
        let res = res.clone();
        thread::spawn(move || {
            engine.wait_for_write_unlock(&res);
            tx.send(()).unwrap();
        })
    };
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    writer.commit().unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    waiter.join().unwrap();
    assert!(!fx.engine.is_write_locked(&res));

    let reader = fx.engine.open_input_stream(&res).unwrap();
    assert!(fx.engine.is_read_locked(&res));
    drop(reader);
    assert!(!fx.engine.is_read_locked(&res));
    fx.engine.wait_for_read_unlock(&res);
}

#[test]
fn simple_strategy_never_reports_locks() {
    let fx = Fixture::new(CacheStrategy::Simple);
    let res = resource(&fx.location(false), "a.jar");
    let _writer = fx.engine.open_output_stream(&res).unwrap();

    fx.engine.lock_write(&res);
    assert!(!fx.engine.is_write_locked(&res));
    fx.engine.wait_for_write_unlock(&res);
    fx.engine.unlock_write(&res);
    fx.engine.cleanup_current_thread();
}

#[test]
fn joinable_cleanup_releases_the_current_threads_handles() {
    let fx = Fixture::new(CacheStrategy::Joinable);
    let res = resource(&fx.location(false), "a.jar");
    let writer = fx.engine.open_output_stream(&res).unwrap();
    assert!(fx.engine.is_write_locked(&res));

    fx.engine.cleanup_current_thread();
    assert!(!fx.engine.is_write_locked(&res));
    drop(writer);
}

#[test]
fn joinable_reporting_starts_and_stops_with_the_engine() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        strategy: CacheStrategy::Joinable,
        report_interval_secs: 1,
        ..CacheConfig::new(tmp.path())
    };
    let engine = CacheEngine::new(config);
    engine.start_reporting();
    engine.stop_reporting();
    engine.start_reporting();
    // Dropping the engine joins the reporter.
    drop(engine);
}

#[test]
fn alias_linking_request_still_copies() {
    let tmp = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        alias_linking: true,
        ..CacheConfig::new(tmp.path())
    };
    let engine = CacheEngine::new(config);
    assert!(engine.is_alias_linking_enabled());

    let loc = Arc::new(Location::new("central"));
    let from = resource(&loc, "a.txt");
    let to = resource(&loc, "b.txt");
    write(&engine, &from, b"a");
    engine.create_alias(&from, &to).unwrap();

    let from_meta = fs::metadata(engine.file_path(&from)).unwrap();
    let to_meta = fs::metadata(engine.file_path(&to)).unwrap();
    assert_eq!(from_meta.len(), to_meta.len());
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_ne!(from_meta.ino(), to_meta.ino());
    }
}
