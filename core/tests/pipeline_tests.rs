use dmgtweak_core::test_utils::{info_json, RecordingSink, ScriptedExecutor};
use dmgtweak_core::{
    Access, CompactionStrategy, ConversionPipeline, ConversionRequest, CreateMode, CreationRequest, Direction,
    ErrorKind, EventStatus, Filesystem, Invocation, Passphrase, ProcessResult, Settings, Stage,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn ok(stdout: impl Into<String>) -> ProcessResult {
    ProcessResult::new(stdout, "", 0)
}

fn fail(stderr: &str, status: i32) -> ProcessResult {
    ProcessResult::new("", stderr, status)
}

fn verb(inv: &Invocation) -> &str {
    inv.arg_list().first().map(String::as_str).unwrap_or("")
}

fn is_hdiutil(inv: &Invocation, wanted: &str) -> bool {
    inv.program_name() == "hdiutil" && verb(inv) == wanted
}

/// Behaves like the real tools on an idle machine: nothing is attached,
/// conversions write their output file, and attach reports `mount`.
fn standard_answer(inv: &Invocation, mount: Option<&Path>) -> ProcessResult {
    let args = inv.arg_list();
    match (inv.program_name().as_str(), verb(inv)) {
        ("hdiutil", "info") => ok("<plist/>"),
        ("plutil", _) if args.last().map(String::as_str) == Some("-") => ok(info_json(&[])),
        ("plutil", _) => ok("{}"),
        ("hdiutil", "attach") => match mount {
            Some(mount) => ok(format!(
                "/dev/disk4\tGUID_partition_scheme\t\n/dev/disk4s1\tApple_HFS\t{}\n",
                mount.display()
            )),
            None => ok("/dev/disk4\tGUID_partition_scheme\t\n"),
        },
        ("hdiutil", "create") => {
            fs::write(args.last().unwrap(), b"image").unwrap();
            ok("created: image")
        }
        ("hdiutil", "convert") => {
            let out = &args[args.iter().position(|a| a == "-o").unwrap() + 1];
            let written = if args.iter().any(|a| a == "UDSP") {
                format!("{}.sparseimage", out)
            } else {
                out.clone()
            };
            fs::write(written, b"image").unwrap();
            ok("created: image")
        }
        ("hdiutil", "resize") if args.iter().any(|a| a == "-limits") => ok("  100\t  200\t 99999999\n"),
        ("GetFileInfo", _) => ok("1\n"),
        _ => ok(""),
    }
}

fn tools<F>(mount: Option<PathBuf>, overrides: F) -> Arc<ScriptedExecutor>
where
    F: Fn(&Invocation) -> Option<ProcessResult> + Send + Sync + 'static,
{
    Arc::new(ScriptedExecutor::new(move |inv| {
        Ok(overrides(inv).unwrap_or_else(|| standard_answer(inv, mount.as_deref())))
    }))
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Volumes")).unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn settings(&self) -> Settings {
        Settings {
            settle_interval_ms: 0,
            volumes_root: self.path("Volumes"),
            temp_dir: Some(self.path("tmp")),
            ..Settings::default()
        }
    }

    fn source_image(&self) -> PathBuf {
        let image = self.path("source.dmg");
        fs::write(&image, b"image").unwrap();
        image
    }

    /// Mounted volume holding `Tool.app`.
    fn volume_with_app(&self) -> PathBuf {
        self.volume_at("Volumes/Tool")
    }

    fn volume_at(&self, relative: &str) -> PathBuf {
        let mount = self.path(relative);
        let resources = mount.join("Tool.app/Contents/Resources");
        fs::create_dir_all(&resources).unwrap();
        fs::write(mount.join("Tool.app/Contents/Info.plist"), b"<plist/>").unwrap();
        fs::write(resources.join("AppIcon.icns"), b"icns").unwrap();
        mount
    }

    fn leftover_temp_files(&self) -> Vec<PathBuf> {
        fs::read_dir(self.path("tmp"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    fn pipeline(&self, executor: Arc<ScriptedExecutor>) -> ConversionPipeline {
        ConversionPipeline::new(executor, self.settings())
    }
}

fn to_read_only(fixture: &Fixture, embed_app_icon: bool) -> ConversionRequest {
    ConversionRequest {
        source: fixture.source_image(),
        destination: fixture.path("out.dmg"),
        direction: Direction::WritableToReadOnly,
        embed_app_icon,
        passphrase: Passphrase::default(),
    }
}

fn conversions(executor: &ScriptedExecutor) -> Vec<Vec<String>> {
    executor
        .hdiutil_calls("convert")
        .into_iter()
        .map(|inv| inv.arg_list().to_vec())
        .collect()
}

#[tokio::test]
async fn test_create_from_folder() {
    let fixture = Fixture::new();
    let source = fixture.path("src");
    fs::create_dir_all(&source).unwrap();
    let destination = fixture.path("out.dmg");

    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let request = CreationRequest {
        mode: CreateMode::FromFolder,
        source_folder: Some(source.clone()),
        size: String::new(),
        volume_name: "Test".to_string(),
        filesystem: Filesystem::Apfs,
        access: Access::ReadOnly,
        destination: destination.clone(),
        passphrase: Passphrase::default(),
    };
    let outcome = fixture.pipeline(executor.clone()).create(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.output.as_deref(), Some(destination.as_path()));
    let create = executor.hdiutil_calls("create");
    assert_eq!(create.len(), 1);
    assert_eq!(
        create[0].arg_list(),
        [
            "create".to_string(),
            "-volname".to_string(),
            "Test".to_string(),
            "-fs".to_string(),
            "APFS".to_string(),
            "-format".to_string(),
            "UDZO".to_string(),
            "-srcfolder".to_string(),
            source.display().to_string(),
            destination.display().to_string(),
        ]
    );

    let terminal: Vec<_> = sink.events().into_iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].status, EventStatus::Succeeded);
    assert!(terminal[0].message.contains(&destination.display().to_string()));
}

#[tokio::test]
async fn test_create_keeps_passphrase_out_of_events() {
    let fixture = Fixture::new();
    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let request = CreationRequest {
        mode: CreateMode::Empty,
        source_folder: None,
        size: "200m".to_string(),
        volume_name: "Vault".to_string(),
        filesystem: Filesystem::Apfs,
        access: Access::ReadWrite,
        destination: fixture.path("vault.dmg"),
        passphrase: Passphrase::new("secret"),
    };
    let outcome = fixture.pipeline(executor.clone()).create(&request, &sink).await;

    assert!(outcome.succeeded());
    assert!(sink.messages().iter().all(|m| !m.contains("secret")));
    let create = &executor.hdiutil_calls("create")[0];
    assert_eq!(create.stdin_bytes(), Some(&b"secret"[..]));
    assert!(create.arg_list().iter().all(|a| a != "secret"));
}

#[tokio::test]
async fn test_invalid_size_runs_nothing() {
    let fixture = Fixture::new();
    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let request = CreationRequest {
        mode: CreateMode::Empty,
        source_folder: None,
        size: "lots".to_string(),
        volume_name: "Scratch".to_string(),
        filesystem: Filesystem::HfsPlusJournaled,
        access: Access::ReadWrite,
        destination: fixture.path("scratch.dmg"),
        passphrase: Passphrase::default(),
    };
    let outcome = fixture.pipeline(executor.clone()).create(&request, &sink).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::Validation));
    assert!(executor.invocations().is_empty());
    assert_eq!(sink.terminal().unwrap().status, EventStatus::Failed);
}

#[tokio::test]
async fn test_compress_without_icon() {
    let fixture = Fixture::new();
    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, false);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert!(outcome.warnings.is_empty());
    assert_eq!(
        conversions(&executor),
        vec![vec![
            "convert".to_string(),
            request.source.display().to_string(),
            "-format".to_string(),
            "UDZO".to_string(),
            "-o".to_string(),
            request.destination.display().to_string(),
            "-imagekey".to_string(),
            "zlib-level=9".to_string(),
        ]]
    );
    assert!(executor.hdiutil_calls("attach").is_empty());
}

#[tokio::test]
async fn test_existing_destination_replaced() {
    let fixture = Fixture::new();
    let request = to_read_only(&fixture, false);
    fs::write(&request.destination, b"old").unwrap();

    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let outcome = fixture.pipeline(executor).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(fs::read(&request.destination).unwrap(), b"image");
    assert!(sink.messages().iter().any(|m| m.starts_with("Existing destination removed")));
}

#[tokio::test]
async fn test_busy_source_stops_before_conversion() {
    let fixture = Fixture::new();
    let request = to_read_only(&fixture, false);
    let held = request.source.display().to_string();

    let executor = tools(None, move |inv| match inv.program_name().as_str() {
        "plutil" => Some(ok(info_json(&[(held.as_str(), &["/dev/disk2"], &[])]))),
        "hdiutil" if verb(inv) == "detach" => Some(fail("Resource busy", 16)),
        _ => None,
    });
    let sink = RecordingSink::default();
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::MountBusy));
    assert!(conversions(&executor).is_empty());
    assert_eq!(executor.count(|inv| is_hdiutil(inv, "detach")), 3);
}

#[tokio::test]
async fn test_expand_grows_image() {
    let fixture = Fixture::new();
    let executor = tools(None, |_| None);
    let sink = RecordingSink::default();
    let request = ConversionRequest {
        direction: Direction::ReadOnlyToWritable,
        ..to_read_only(&fixture, false)
    };
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert!(outcome.warnings.is_empty());
    assert_eq!(conversions(&executor)[0][3], "UDRW");
    let resizes = executor.hdiutil_calls("resize");
    assert_eq!(resizes.len(), 2);
    // 200 sectors plus 1 GiB of 512-byte sectors
    assert_eq!(
        resizes[1].arg_list(),
        [
            "resize".to_string(),
            "-size".to_string(),
            "2097352b".to_string(),
            request.destination.display().to_string(),
        ]
    );
}

#[tokio::test]
async fn test_failed_resize_is_a_warning() {
    let fixture = Fixture::new();
    let executor = tools(None, |inv| {
        is_hdiutil(inv, "resize").then(|| fail("hdiutil: resize: failed", 1))
    });
    let sink = RecordingSink::default();
    let request = ConversionRequest {
        direction: Direction::ReadOnlyToWritable,
        ..to_read_only(&fixture, false)
    };
    let outcome = fixture.pipeline(executor).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.stage, Stage::Done);
    assert_eq!(outcome.warning_kinds(), vec![ErrorKind::ProcessFailure]);
    assert!(request.destination.exists());
    assert!(sink.count(Stage::Resize, EventStatus::Warning) >= 1);
    assert_eq!(sink.terminal().unwrap().status, EventStatus::Succeeded);
}

#[tokio::test]
async fn test_icon_conversion_recreates_and_sets_icon() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount.clone()), |_| None);
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, true);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let attaches = executor.hdiutil_calls("attach");
    assert_eq!(attaches.len(), 2);
    assert!(attaches[0].arg_list().iter().any(|a| a == "-readonly"));
    assert!(attaches[1].arg_list().iter().all(|a| a != "-readonly"));

    let create = &executor.hdiutil_calls("create")[0];
    let args = create.arg_list();
    assert_eq!(args[args.iter().position(|a| a == "-srcfolder").unwrap() + 1], mount.display().to_string());
    assert_eq!(args[args.iter().position(|a| a == "-volname").unwrap() + 1], "Tool");

    let converts = conversions(&executor);
    assert_eq!(converts.len(), 1);
    assert!(converts[0][1].contains("temp_recreated"));
    assert_eq!(converts[0][5], request.destination.display().to_string());

    let sips = executor
        .invocations()
        .into_iter()
        .filter(|inv| inv.program_name() == "sips" && inv.arg_list()[0] == "-i")
        .collect::<Vec<_>>();
    assert_eq!(sips.len(), 1);
    assert_eq!(sips[0].arg_list()[2], request.destination.display().to_string());

    assert!(fixture.leftover_temp_files().is_empty());
}

#[tokio::test]
async fn test_recreated_volume_keeps_reported_name() {
    let fixture = Fixture::new();
    // Another "Tool" volume was already mounted
    let mount = fixture.volume_at("Volumes/Tool 1");
    let executor = tools(Some(mount), |inv| match inv.program_name().as_str() {
        "diskutil" => Some(ok("<plist>disk4s1</plist>")),
        "plutil" if inv.stdin_bytes() == Some(&b"<plist>disk4s1</plist>"[..]) => {
            Some(ok(r#"{"VolumeName":"Tool"}"#))
        }
        _ => None,
    });
    let sink = RecordingSink::default();
    let outcome = fixture
        .pipeline(executor.clone())
        .convert(&to_read_only(&fixture, true), &sink)
        .await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let create = &executor.hdiutil_calls("create")[0];
    let args = create.arg_list();
    assert_eq!(args[args.iter().position(|a| a == "-volname").unwrap() + 1], "Tool");
}

#[tokio::test]
async fn test_preserved_volume_icon_restored() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    fs::write(mount.join(".VolumeIcon.icns"), b"volume").unwrap();
    let executor = tools(Some(mount), |_| None);
    let sink = RecordingSink::default();
    let outcome = fixture
        .pipeline(executor.clone())
        .convert(&to_read_only(&fixture, true), &sink)
        .await;

    assert!(outcome.succeeded());
    assert_eq!(executor.hdiutil_calls("attach").len(), 3);
    assert_eq!(executor.count(|inv| inv.program_name() == "SetFile"), 3);
    assert!(fixture.leftover_temp_files().is_empty());
}

#[tokio::test]
async fn test_icon_failure_still_succeeds() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount), |inv| match inv.program_name().as_str() {
        "sips" => Some(fail("not an image", 1)),
        "GetFileInfo" => Some(ok("0\n")),
        _ => None,
    });
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, true);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.output.as_deref(), Some(request.destination.as_path()));
    assert_eq!(outcome.warning_kinds(), vec![ErrorKind::IconMethodFailed]);
    assert_eq!(executor.count(|inv| inv.program_name() == "cp"), 1);
    assert_eq!(sink.terminal().unwrap().status, EventStatus::Succeeded);
}

#[tokio::test]
async fn test_failed_writable_mount_falls_back_to_direct() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount), |inv| {
        (is_hdiutil(inv, "attach") && inv.arg_list().iter().all(|a| a != "-readonly"))
            .then(|| fail("hdiutil: attach failed - Resource busy", 16))
    });
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, true);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.warning_kinds(), vec![ErrorKind::ProcessFailure]);
    assert!(executor.hdiutil_calls("create").is_empty());
    let converts = conversions(&executor);
    assert_eq!(converts.len(), 1);
    assert_eq!(converts[0][1], request.source.display().to_string());
    // The file icon is still applied to the directly compressed image
    assert_eq!(executor.count(|inv| inv.program_name() == "sips" && inv.arg_list()[0] == "-i"), 1);
    assert!(fixture.leftover_temp_files().is_empty());
}

#[tokio::test]
async fn test_missing_bundle_compresses_plainly() {
    let fixture = Fixture::new();
    let mount = fixture.path("Volumes/Empty");
    fs::create_dir_all(&mount).unwrap();
    let executor = tools(Some(mount), |_| None);
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, true);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.warning_kinds(), vec![ErrorKind::IconNotFound]);
    assert_eq!(conversions(&executor)[0][1], request.source.display().to_string());
    assert_eq!(executor.count(|inv| inv.program_name() == "sips"), 0);
    assert_eq!(executor.count(|inv| is_hdiutil(inv, "detach")), 1);
}

#[tokio::test]
async fn test_sparse_strategy() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount.clone()), |_| None);
    let sink = RecordingSink::default();
    let pipeline = ConversionPipeline::new(
        executor.clone(),
        Settings {
            compaction: CompactionStrategy::Sparse,
            ..fixture.settings()
        },
    );
    let request = to_read_only(&fixture, true);
    let outcome = pipeline.convert(&request, &sink).await;

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let converts = conversions(&executor);
    let formats: Vec<&str> = converts.iter().map(|args| args[3].as_str()).collect();
    assert_eq!(formats, vec!["UDRW", "UDSP", "UDZO"]);
    assert!(converts[2][1].ends_with(".sparseimage"));
    assert_eq!(fs::read(mount.join(".VolumeIcon.icns")).unwrap(), b"icns");
    assert!(fixture.leftover_temp_files().is_empty());
}

#[tokio::test]
async fn test_failed_compression_cleans_up() {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount), |inv| {
        is_hdiutil(inv, "convert").then(|| fail("hdiutil: convert failed - No space left on device", 28))
    });
    let sink = RecordingSink::default();
    let request = to_read_only(&fixture, true);
    let outcome = fixture.pipeline(executor.clone()).convert(&request, &sink).await;

    assert_eq!(outcome.error_kind(), Some(ErrorKind::ProcessFailure));
    assert_eq!(outcome.output, None);
    assert!(fixture.leftover_temp_files().is_empty());
    let terminal = sink.terminal().unwrap();
    assert_eq!(terminal.status, EventStatus::Failed);
    assert_eq!(terminal.exit_code, Some(28));
}

#[tokio::test]
async fn test_spawned_conversion_streams_events() {
    let fixture = Fixture::new();
    let executor = tools(None, |_| None);
    let pipeline = Arc::new(fixture.pipeline(executor));
    let (mut events, handle) = pipeline.spawn_convert(to_read_only(&fixture, false));

    let mut received = Vec::new();
    while let Some(event) = events.recv().await {
        received.push(event);
    }
    let outcome = handle.await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(received.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(received.last().unwrap().is_terminal());
    assert!(received.iter().any(|e| e.status == EventStatus::Command));
}

/// Runs an encrypted conversion and checks that every image command gets the
/// passphrase on stdin, every produced image is encrypted, and no event
/// leaks the passphrase.
async fn assert_encrypted_chain(strategy: CompactionStrategy, direction: Direction, embed_app_icon: bool) {
    let fixture = Fixture::new();
    let mount = fixture.volume_with_app();
    let executor = tools(Some(mount), |_| None);
    let sink = RecordingSink::default();
    let pipeline = ConversionPipeline::new(
        executor.clone(),
        Settings {
            compaction: strategy,
            ..fixture.settings()
        },
    );
    let request = ConversionRequest {
        direction,
        passphrase: Passphrase::new("secret"),
        ..to_read_only(&fixture, embed_app_icon)
    };
    let outcome = pipeline.convert(&request, &sink).await;
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let image_commands: Vec<Invocation> = executor
        .invocations()
        .into_iter()
        .filter(|inv| inv.program_name() == "hdiutil")
        .filter(|inv| matches!(verb(inv), "attach" | "create" | "convert" | "resize"))
        .collect();
    assert!(!image_commands.is_empty());
    for inv in &image_commands {
        assert_eq!(inv.stdin_bytes(), Some(&b"secret"[..]), "{:?}", inv.arg_list());
        assert!(inv.arg_list().iter().any(|a| a == "-stdinpass"));
        assert!(inv.arg_list().iter().all(|a| a != "secret"));
    }
    for inv in image_commands.iter().filter(|inv| matches!(verb(inv), "create" | "convert")) {
        let args = inv.arg_list();
        let cipher = args.iter().position(|a| a == "-encryption").map(|i| args[i + 1].as_str());
        assert_eq!(cipher, Some("AES-256"), "{:?}", args);
    }
    let converts = conversions(&executor);
    assert!(converts
        .iter()
        .any(|args| args.contains(&request.destination.display().to_string())));
    assert!(sink.messages().iter().all(|m| !m.contains("secret")));
    assert!(fixture.leftover_temp_files().is_empty());
}

#[tokio::test]
async fn test_encrypted_compression_stays_encrypted() {
    assert_encrypted_chain(CompactionStrategy::Direct, Direction::WritableToReadOnly, false).await;
}

#[tokio::test]
async fn test_encrypted_expand_stays_encrypted() {
    assert_encrypted_chain(CompactionStrategy::Direct, Direction::ReadOnlyToWritable, false).await;
}

#[tokio::test]
async fn test_encrypted_icon_conversion_with_recreate() {
    assert_encrypted_chain(CompactionStrategy::Recreate, Direction::WritableToReadOnly, true).await;
}

#[tokio::test]
async fn test_encrypted_icon_conversion_with_sparse() {
    assert_encrypted_chain(CompactionStrategy::Sparse, Direction::WritableToReadOnly, true).await;
}

#[tokio::test]
async fn test_encrypted_icon_conversion_direct() {
    assert_encrypted_chain(CompactionStrategy::Direct, Direction::WritableToReadOnly, true).await;
}
