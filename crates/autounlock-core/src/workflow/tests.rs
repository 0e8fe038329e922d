use super::*;
use crate::dracut::render_dropin;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const ORIGINAL_CRYPTTAB: &str = "\
# <name> <device> <password> <options>
luks-U1 UUID=U1 none discard
luks-U10 UUID=U10 none discard
swap /dev/sda3 /dev/urandom swap
";

#[derive(Default)]
struct MockBlock {
    by_uuid: HashMap<String, PathBuf>,
    not_block: HashSet<PathBuf>,
}

impl MockBlock {
    fn with(devices: &[(&str, &str)]) -> Self {
        Self {
            by_uuid: devices
                .iter()
                .map(|(uuid, dev)| (uuid.to_string(), PathBuf::from(dev)))
                .collect(),
            not_block: HashSet::new(),
        }
    }
}

impl BlockDeviceIndex for MockBlock {
    type Error = AutounlockError;

    fn device_by_uuid(&self, uuid: &str) -> AutounlockResult<Option<PathBuf>> {
        Ok(self.by_uuid.get(uuid).cloned())
    }

    fn device_uuid(&self, device: &Path) -> AutounlockResult<Option<String>> {
        Ok(self
            .by_uuid
            .iter()
            .find(|(_, dev)| dev.as_path() == device)
            .map(|(uuid, _)| uuid.clone()))
    }

    fn is_block_device(&self, device: &Path) -> bool {
        !self.not_block.contains(device)
    }
}

#[derive(Default)]
struct MockLuks {
    headers: HashMap<PathBuf, String>,
    fail_add_on: Option<PathBuf>,
    /// When set, only this credential unlocks the containers.
    accept: Option<Vec<u8>>,
    key_file_credentials: Cell<usize>,
    added: RefCell<Vec<(PathBuf, PathBuf)>>,
    removed: RefCell<Vec<(PathBuf, PathBuf)>>,
}

impl MockLuks {
    fn with(headers: &[(&str, &str)]) -> Self {
        Self {
            headers: headers
                .iter()
                .map(|(dev, uuid)| (PathBuf::from(dev), uuid.to_string()))
                .collect(),
            ..Self::default()
        }
    }
}

impl LuksProvider for MockLuks {
    type Error = AutounlockError;

    fn is_luks(&self, device: &Path) -> AutounlockResult<bool> {
        Ok(self.headers.contains_key(device))
    }

    fn luks_uuid(&self, device: &Path) -> AutounlockResult<String> {
        self.headers
            .get(device)
            .cloned()
            .ok_or_else(|| AutounlockError::Provider("not a LUKS device".into()))
    }

    fn add_key(
        &self,
        device: &Path,
        existing: &ExistingKey,
        keyfile: &Path,
    ) -> AutounlockResult<()> {
        assert!(!existing.is_empty());
        assert!(keyfile.exists(), "key file must exist before enrollment");
        if self.fail_add_on.as_deref() == Some(device) {
            return Err(AutounlockError::Provider("No key available with this passphrase.".into()));
        }
        if matches!(existing, ExistingKey::KeyFile(_)) {
            self.key_file_credentials
                .set(self.key_file_credentials.get() + 1);
        }
        if let Some(enrolled) = &self.accept {
            let presented = match existing {
                ExistingKey::Passphrase(bytes) => bytes.to_vec(),
                ExistingKey::KeyFile(path) => fs::read(path).unwrap_or_default(),
            };
            if &presented != enrolled {
                return Err(AutounlockError::Provider("No key available with this passphrase.".into()));
            }
        }
        self.added
            .borrow_mut()
            .push((device.to_path_buf(), keyfile.to_path_buf()));
        Ok(())
    }

    fn remove_key(&self, device: &Path, keyfile: &Path) -> AutounlockResult<()> {
        self.removed
            .borrow_mut()
            .push((device.to_path_buf(), keyfile.to_path_buf()));
        Ok(())
    }
}

/// Builds its "image" from whatever the drop-in lists at rebuild time.
struct MockBoot {
    dropin: PathBuf,
    image: RefCell<String>,
    rebuilds: Cell<usize>,
    grub_runs: Cell<usize>,
    omit_keys: bool,
    fail_grub: bool,
}

impl MockBoot {
    fn new(config: &AutounlockConfig) -> Self {
        Self {
            dropin: config.paths.dracut_conf.clone(),
            image: RefCell::new(String::new()),
            rebuilds: Cell::new(0),
            grub_runs: Cell::new(0),
            omit_keys: false,
            fail_grub: false,
        }
    }
}

impl BootProvider for MockBoot {
    type Error = AutounlockError;

    fn rebuild_initramfs(&self) -> AutounlockResult<()> {
        self.rebuilds.set(self.rebuilds.get() + 1);
        let mut listing = String::from("usr/lib/dracut/modules.txt\n");
        if !self.omit_keys {
            let conf = fs::read_to_string(&self.dropin).unwrap_or_default();
            for line in conf.lines().filter(|l| l.starts_with("install_items")) {
                let items = line.split('"').nth(1).unwrap_or_default();
                for item in items.split_whitespace() {
                    listing.push_str(&format!(
                        "-r--------   1 root root 2048 Jan  1 00:00 {}\n",
                        item.trim_start_matches('/')
                    ));
                }
            }
        }
        *self.image.borrow_mut() = listing;
        Ok(())
    }

    fn initramfs_listing(&self) -> AutounlockResult<String> {
        Ok(self.image.borrow().clone())
    }

    fn regenerate_boot_config(&self) -> AutounlockResult<()> {
        self.grub_runs.set(self.grub_runs.get() + 1);
        if self.fail_grub {
            return Err(AutounlockError::Provider("grub2-mkconfig exited with status 1".into()));
        }
        Ok(())
    }
}

fn sandbox_config(dir: &TempDir) -> AutounlockConfig {
    let mut config = AutounlockConfig::default();
    config.paths.crypttab = dir.path().join("etc/crypttab");
    config.paths.dracut_conf = dir.path().join("etc/dracut.conf.d/10-crypt.conf");
    config.paths.key_dir = dir.path().join("boot");
    config.paths.grub_config = dir.path().join("boot/grub2/grub.cfg");
    config
}

fn seed_crypttab(config: &AutounlockConfig, contents: &str) {
    fs::create_dir_all(config.paths.crypttab.parent().unwrap()).unwrap();
    fs::write(&config.paths.crypttab, contents).unwrap();
}

fn requests(config: &AutounlockConfig, names: &[&str]) -> Vec<VolumeRequest> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    collect_volumes(&names, config).unwrap()
}

fn two_volumes() -> (MockBlock, MockLuks) {
    (
        MockBlock::with(&[("U1", "/dev/vdb"), ("U2", "/dev/vdc")]),
        MockLuks::with(&[("/dev/vdb", "U1"), ("/dev/vdc", "U2")]),
    )
}

fn passphrase(_binding: &DeviceBinding) -> AutounlockResult<ExistingKey> {
    Ok(ExistingKey::passphrase("correct horse"))
}

fn backups(config: &AutounlockConfig) -> Vec<PathBuf> {
    let dir = config.paths.crypttab.parent().unwrap();
    let mut found: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("crypttab.backup.")
        })
        .collect();
    found.sort();
    found
}

#[test]
fn configure_provisions_every_volume() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let (block, luks) = two_volumes();
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let report = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1", "luks-U2"]),
        passphrase,
    )
    .unwrap();
    assert!(report.title.contains("2 volume(s)"));

    let key1 = config.key_file_path("luks-U1");
    let key2 = config.key_file_path("luks-U2");
    for key in [&key1, &key2] {
        let meta = fs::metadata(key).unwrap();
        assert_eq!(meta.len(), 2048);
        assert_eq!(meta.permissions().mode() & 0o777, 0o400);
    }
    assert_ne!(fs::read(&key1).unwrap(), fs::read(&key2).unwrap());

    let crypttab = fs::read_to_string(&config.paths.crypttab).unwrap();
    let expected = format!(
        "# <name> <device> <password> <options>\n\
         luks-U10 UUID=U10 none discard\n\
         swap /dev/sda3 /dev/urandom swap\n\
         luks-U1 UUID=U1 {} luks,discard\n\
         luks-U2 UUID=U2 {} luks,discard\n",
        key1.display(),
        key2.display()
    );
    assert_eq!(crypttab, expected);

    let saved = backups(&config);
    assert_eq!(saved.len(), 1);
    assert_eq!(fs::read_to_string(&saved[0]).unwrap(), ORIGINAL_CRYPTTAB);

    assert_eq!(
        fs::read_to_string(&config.paths.dracut_conf).unwrap(),
        render_dropin(&[key1.clone(), key2.clone()])
    );
    assert_eq!(
        *luks.added.borrow(),
        vec![
            (PathBuf::from("/dev/vdb"), key1),
            (PathBuf::from("/dev/vdc"), key2)
        ]
    );
    assert!(luks.removed.borrow().is_empty());
    assert_eq!(boot.rebuilds.get(), 1);
    assert_eq!(boot.grub_runs.get(), 1);
    assert!(report
        .events
        .iter()
        .any(|e| e.level == WorkflowLevel::Security && e.message.contains("SHA-256")));
}

#[test]
fn validation_reports_every_bad_volume_without_writing() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let block = MockBlock::with(&[("U1", "/dev/vdb"), ("U3", "/dev/vdd")]);
    let luks = MockLuks::with(&[("/dev/vdb", "U1")]);
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let asked = Cell::new(0);
    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1", "luks-U2", "luks-U3"]),
        |binding| {
            asked.set(asked.get() + 1);
            passphrase(binding)
        },
    )
    .unwrap_err();

    match err {
        AutounlockError::Validation(issues) => {
            assert_eq!(issues.len(), 2, "{issues:?}");
            assert!(issues[0].contains("U2"));
            assert!(issues[1].contains("not a valid LUKS"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(asked.get(), 0);
    assert_eq!(
        fs::read_to_string(&config.paths.crypttab).unwrap(),
        ORIGINAL_CRYPTTAB
    );
    assert!(backups(&config).is_empty());
    assert!(!config.key_file_path("luks-U1").exists());
    assert!(!config.paths.dracut_conf.exists());
    assert_eq!(boot.rebuilds.get(), 0);
}

#[test]
fn header_uuid_mismatch_fails_validation() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    let block = MockBlock::with(&[("U1", "/dev/vdb")]);
    let luks = MockLuks::with(&[("/dev/vdb", "U9")]);
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = check_volumes(&config, &providers, &requests(&config, &["luks-U1"])).unwrap_err();
    assert!(err.to_string().contains("carries UUID U9"));
}

#[test]
fn rerun_keeps_one_entry_per_volume() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let (block, luks) = two_volumes();
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };
    let volumes = requests(&config, &["luks-U1", "luks-U2"]);

    configure_autounlock(&config, &providers, &volumes, passphrase).unwrap();
    let first = fs::read_to_string(&config.paths.crypttab).unwrap();
    let report = configure_autounlock(&config, &providers, &volumes, passphrase).unwrap();
    let second = fs::read_to_string(&config.paths.crypttab).unwrap();

    assert_eq!(first, second);
    let tab = crate::crypttab::Crypttab::parse(&config.paths.crypttab, &second).unwrap();
    assert_eq!(tab.count_named("luks-U1"), 1);
    assert_eq!(tab.count_named("luks-U2"), 1);
    assert_eq!(tab.count_named("luks-U10"), 1);
    assert_eq!(backups(&config).len(), 2);
    assert!(report
        .events
        .iter()
        .any(|e| e.level == WorkflowLevel::Warn && e.message.contains("already exists")));
}

#[test]
fn missing_key_in_initramfs_rolls_everything_back() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let (block, luks) = two_volumes();
    let boot = MockBoot {
        omit_keys: true,
        ..MockBoot::new(&config)
    };
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1", "luks-U2"]),
        passphrase,
    )
    .unwrap_err();

    match &err {
        AutounlockError::RolledBack {
            source,
            failures,
            events,
        } => {
            assert!(source.to_string().contains("missing key file"));
            assert!(failures.is_empty(), "{failures:?}");
            assert!(events.iter().any(|e| e.level == WorkflowLevel::Success));
            let errors: Vec<_> = events
                .iter()
                .filter(|e| e.level == WorkflowLevel::Error)
                .collect();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].message.contains("missing key file"));
            assert_eq!(events.last().unwrap().level, WorkflowLevel::Warn);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(
        fs::read_to_string(&config.paths.crypttab).unwrap(),
        ORIGINAL_CRYPTTAB
    );
    assert!(!config.key_file_path("luks-U1").exists());
    assert!(!config.key_file_path("luks-U2").exists());
    assert!(!config.paths.dracut_conf.exists());
    assert_eq!(luks.removed.borrow().len(), 2);
    assert_eq!(luks.removed.borrow()[0].0, PathBuf::from("/dev/vdc"));
    assert_eq!(boot.rebuilds.get(), 2);
    assert_eq!(boot.grub_runs.get(), 0);
}

#[test]
fn boot_loader_failure_restores_previous_dropin() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    fs::create_dir_all(config.paths.dracut_conf.parent().unwrap()).unwrap();
    fs::write(&config.paths.dracut_conf, "install_items+=\" /old.bin \"\n").unwrap();
    let (block, luks) = two_volumes();
    let boot = MockBoot {
        fail_grub: true,
        ..MockBoot::new(&config)
    };
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1"]),
        passphrase,
    )
    .unwrap_err();

    assert!(matches!(err.root_cause(), AutounlockError::Provider(_)));
    assert_eq!(
        fs::read_to_string(&config.paths.dracut_conf).unwrap(),
        "install_items+=\" /old.bin \"\n"
    );
    assert_eq!(
        fs::read_to_string(&config.paths.crypttab).unwrap(),
        ORIGINAL_CRYPTTAB
    );
    assert_eq!(luks.removed.borrow().len(), 1);
    assert_eq!(boot.rebuilds.get(), 2);
}

#[test]
fn failed_enrollment_undoes_only_completed_volumes() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    let (block, mut luks) = two_volumes();
    luks.fail_add_on = Some(PathBuf::from("/dev/vdc"));
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1", "luks-U2"]),
        passphrase,
    )
    .unwrap_err();

    assert!(err.to_string().contains("No key available"));
    assert!(!config.paths.crypttab.exists());
    assert!(!config.key_file_path("luks-U1").exists());
    assert!(!config.key_file_path("luks-U2").exists());
    assert_eq!(
        *luks.removed.borrow(),
        vec![(PathBuf::from("/dev/vdb"), config.key_file_path("luks-U1"))]
    );
    assert_eq!(boot.rebuilds.get(), 0);
}

#[test]
fn empty_credential_is_rejected_before_writing() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let (block, luks) = two_volumes();
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1"]),
        |_| Ok(ExistingKey::passphrase(Vec::new())),
    )
    .unwrap_err();

    assert!(matches!(err, AutounlockError::Usage(_)));
    assert!(backups(&config).is_empty());
    assert!(!config.key_file_path("luks-U1").exists());
}

#[test]
fn check_reports_plan_and_changes_nothing() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let (block, luks) = two_volumes();
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let report = check_volumes(&config, &providers, &requests(&config, &["luks-U2"])).unwrap();

    assert!(report.title.starts_with("Checked 1 volume(s)"));
    assert!(report
        .events
        .iter()
        .any(|e| e.message.contains("luks-U2 UUID=U2")));
    assert_eq!(
        fs::read_to_string(&config.paths.crypttab).unwrap(),
        ORIGINAL_CRYPTTAB
    );
    assert!(luks.added.borrow().is_empty());
    assert_eq!(boot.rebuilds.get(), 0);
}

#[test]
fn rollback_restores_replaced_key_file() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let key_path = config.key_file_path("luks-U1");
    crate::keyfile::write_raw_key_file(&key_path, b"previous key bytes").unwrap();
    let (block, luks) = two_volumes();
    let boot = MockBoot {
        fail_grub: true,
        ..MockBoot::new(&config)
    };
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let err = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1"]),
        passphrase,
    )
    .unwrap_err();

    assert!(matches!(err, AutounlockError::RolledBack { .. }));
    assert!(err
        .partial_events()
        .iter()
        .any(|e| e.level == WorkflowLevel::Warn && e.message.contains("will be replaced")));
    assert_eq!(fs::read(&key_path).unwrap(), b"previous key bytes");
    let mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o400);
    assert_eq!(luks.removed.borrow().len(), 1);
}

#[test]
fn key_file_being_replaced_can_authorise_its_own_enrollment() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let key_path = config.key_file_path("luks-U1");
    crate::keyfile::write_raw_key_file(&key_path, b"enrolled last time").unwrap();
    let (block, mut luks) = two_volumes();
    luks.accept = Some(b"enrolled last time".to_vec());
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let presented = key_path.clone();
    let report = configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1"]),
        |_| Ok(ExistingKey::KeyFile(presented.clone())),
    )
    .unwrap();

    assert!(report.title.contains("1 volume"));
    assert_eq!(luks.added.borrow().len(), 1);
    assert_eq!(luks.key_file_credentials.get(), 0);
    let replaced = fs::read(&key_path).unwrap();
    assert_ne!(replaced, b"enrolled last time");
    assert_eq!(replaced.len(), config.keys.size_bytes);
}

#[test]
fn unrelated_existing_key_file_is_passed_by_path() {
    let dir = tempdir().unwrap();
    let config = sandbox_config(&dir);
    seed_crypttab(&config, ORIGINAL_CRYPTTAB);
    let recovery = dir.path().join("recovery.key");
    fs::write(&recovery, b"recovery").unwrap();
    let (block, mut luks) = two_volumes();
    luks.accept = Some(b"recovery".to_vec());
    let boot = MockBoot::new(&config);
    let providers = Providers {
        block: &block,
        luks: &luks,
        boot: &boot,
    };

    let presented = recovery.clone();
    configure_autounlock(
        &config,
        &providers,
        &requests(&config, &["luks-U1", "luks-U2"]),
        |_| Ok(ExistingKey::KeyFile(presented.clone())),
    )
    .unwrap();

    assert_eq!(luks.added.borrow().len(), 2);
    assert_eq!(luks.key_file_credentials.get(), 2);
    assert_eq!(fs::read(&recovery).unwrap(), b"recovery");
}
