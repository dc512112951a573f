use std::fs;
use std::path::PathBuf;

use htr_dataset::StoreMode;
use htr_tools::{ToolConfig, DEFAULT_ALPHABET};

fn write_temp_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("htr-tools.toml");
    fs::write(&path, contents).expect("write temp config");
    path
}

#[test]
fn loads_minimal_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_temp_config(&dir, "[store]\npath = \"/data/lines.hkv\"\n");
    let cfg = ToolConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.store_path, Some(PathBuf::from("/data/lines.hkv")));
    assert_eq!(cfg.alphabet, DEFAULT_ALPHABET);
    assert_eq!(cfg.collate.img_height, 80);
    assert_eq!(cfg.loader.batch_size, 16);
}

#[test]
fn loads_all_sections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_temp_config(
        &dir,
        r#"
[store]
path = "lines.hkv"
mode = "inmemory"
multi_channel = true
debug = true
debug_cap = 50

[augment]
augment = true
scale = true
scale_range = [1.2, 1.1]
apply_probability = 0.5

[collate]
img_height = 64
keep_ratio = true

[codec]
alphabet = "abc"
ignore_case = true

[loader]
batch_size = 8
shuffle = false
seed = 7
workers = 2
"#,
    );
    let cfg = ToolConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.source.store_mode, StoreMode::InMemory);
    assert!(cfg.source.multi_channel);
    assert!(cfg.source.debug);
    assert_eq!(cfg.source.debug_cap, 50);
    assert!(cfg.augment.augment && cfg.augment.scale);
    assert_eq!(cfg.augment.scale_range, (1.2, 1.1));
    assert_eq!(cfg.collate.img_height, 64);
    assert_eq!(cfg.collate.img_width, 300);
    assert!(cfg.collate.keep_ratio);
    assert_eq!(cfg.codec().num_classes(), 4);
    assert!(cfg.codec().can_encode("CAB"));
    assert_eq!(cfg.loader.batch_size, 8);
    assert!(!cfg.loader.shuffle);
    assert_eq!(cfg.loader.seed, Some(7));
    assert_eq!(cfg.workers, 2);
    assert_eq!(cfg.prefetch, 4);
}

#[test]
fn alphabet_file_overrides_inline_alphabet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let charset = dir.path().join("charset.txt");
    fs::write(&charset, "xyz\n").expect("write charset");
    let path = write_temp_config(
        &dir,
        &format!(
            "[codec]\nalphabet = \"abc\"\nalphabet_file = \"{}\"\n",
            charset.display()
        ),
    );
    let cfg = ToolConfig::from_path(&path).expect("load config");
    assert_eq!(cfg.alphabet, "xyz");
}

#[test]
fn missing_file_is_none() {
    assert!(ToolConfig::from_path(std::path::Path::new("/nonexistent/htr-tools.toml")).is_none());
}

#[test]
fn malformed_file_falls_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_temp_config(&dir, "[store\npath = ");
    assert!(ToolConfig::from_path(&path).is_none());
    assert!(ToolConfig::try_from_path(&path).is_err());
}
