//! End-to-end squash runs over a disk-backed image store.

use std::path::{Path, PathBuf};

use docker_squash_core::config::StoreConfig;
use docker_squash_core::error::SquashError;
use docker_squash_engine::archive;
use docker_squash_engine::digest;
use docker_squash_engine::metadata::{HistoryEntry, ImageConfig, ImageManifest, Rootfs};
use docker_squash_engine::squash::{SquashOptions, Squasher};
use docker_squash_engine::store::{ImageStore, LocalStore};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;

/// Build an uncompressed layer tar from (name, payload) pairs.
fn build_layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (name, content) in entries {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Install a classic docker-save image into a store root.
///
/// `layers` are (directory id, tar bytes) pairs, bottom layer first;
/// one non-empty history entry is generated per layer.
fn install_image(
    store_root: &Path,
    image_id: &str,
    reference: &str,
    layers: &[(&str, Vec<u8>)],
    created_bys: &[&str],
) {
    let image_dir = store_root.join(image_id);
    std::fs::create_dir_all(&image_dir).unwrap();

    let mut diff_ids = Vec::new();
    for (layer_id, tar_bytes) in layers {
        let layer_dir = image_dir.join(layer_id);
        std::fs::create_dir_all(&layer_dir).unwrap();
        std::fs::write(layer_dir.join("layer.tar"), tar_bytes).unwrap();
        std::fs::write(layer_dir.join("VERSION"), "1.0").unwrap();

        let descriptor = ImageConfig {
            id: layer_id.to_string(),
            ..Default::default()
        };
        std::fs::write(
            layer_dir.join("json"),
            serde_json::to_vec(&descriptor).unwrap(),
        )
        .unwrap();

        diff_ids.push(format!("sha256:{}", digest::sha256_bytes(tar_bytes)));
    }

    let history = created_bys
        .iter()
        .map(|created_by| HistoryEntry {
            created: "2024-03-01T10:00:00Z".to_string(),
            created_by: created_by.to_string(),
            ..Default::default()
        })
        .collect();

    let config = ImageConfig {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        docker_version: "24.0.5".to_string(),
        created: "2024-03-01T10:00:00Z".to_string(),
        history: Some(history),
        rootfs: Rootfs {
            kind: "layers".to_string(),
            diff_ids: Some(diff_ids),
        },
        ..Default::default()
    };
    std::fs::write(
        image_dir.join(format!("{image_id}.json")),
        serde_json::to_vec(&config).unwrap(),
    )
    .unwrap();

    let manifest = ImageManifest {
        config: format!("{image_id}.json"),
        repo_tags: Some(vec![reference.to_string()]),
        layers: layers
            .iter()
            .map(|(id, _)| format!("{id}/layer.tar"))
            .collect(),
        layer_sources: None,
    };
    std::fs::write(
        image_dir.join("manifest.json"),
        serde_json::to_vec(&vec![manifest]).unwrap(),
    )
    .unwrap();

    std::fs::write(
        store_root.join("index.json"),
        serde_json::to_string(&serde_json::json!({
            "references": { reference: image_id }
        }))
        .unwrap(),
    )
    .unwrap();
}

/// Collect (name, payload) pairs from a tar file.
fn read_tar_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
    use std::io::Read;

    let file = std::fs::File::open(path).unwrap();
    let mut archive = tar::Archive::new(file);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (name, content)
        })
        .collect()
}

/// Unpack the exported archive and read its manifest and config.
fn read_output(output_tar: &Path, dir: &Path) -> (ImageManifest, ImageConfig, PathBuf) {
    let file = std::fs::File::open(output_tar).unwrap();
    archive::unpack_archive(file, dir).unwrap();

    let manifests: Vec<ImageManifest> =
        serde_json::from_slice(&std::fs::read(dir.join("manifest.json")).unwrap()).unwrap();
    let manifest = manifests.into_iter().next().unwrap();
    let config_path = dir.join(&manifest.config);
    let config: ImageConfig =
        serde_json::from_slice(&std::fs::read(&config_path).unwrap()).unwrap();
    (manifest, config, config_path)
}

#[test]
fn test_squash_whole_image_to_single_layer() {
    let store_root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    // Bottom layer writes /a/b.txt = "v1", top overwrites it to "v2".
    install_image(
        store_root.path(),
        "srcimage01",
        "test:latest",
        &[
            ("layer1", build_layer_tar(&[("a/b.txt", b"v1")])),
            ("layer2", build_layer_tar(&[("a/b.txt", b"v2")])),
        ],
        &["ADD a/b.txt", "RUN rewrite b.txt"],
    );

    let store = LocalStore::open(store_root.path(), StoreConfig::default()).unwrap();
    let output_tar = work.path().join("out.tar");
    let options = SquashOptions {
        image: "test:latest".to_string(),
        tag: Some("test:squashed".to_string()),
        message: "squash image".to_string(),
        output_path: Some(output_tar.clone()),
        load_image: true,
        ..Default::default()
    };

    let image_id = Squasher::new(&store, options).run().unwrap();
    assert_eq!(image_id.len(), 64);

    let extracted = TempDir::new().unwrap();
    let (manifest, config, config_path) = read_output(&output_tar, extracted.path());

    // One merged layer; manifest and rootfs agree.
    assert_eq!(manifest.layers.len(), 1);
    let diff_ids = config.rootfs.diff_ids.as_ref().unwrap();
    assert_eq!(diff_ids.len(), 1);
    assert_eq!(manifest.config, format!("{image_id}.json"));
    assert_eq!(
        manifest.repo_tags,
        Some(vec!["test:squashed".to_string()])
    );

    // The recorded diff id matches the merged tar on disk.
    let layer_tar = extracted.path().join(&manifest.layers[0]);
    assert_eq!(
        diff_ids[0],
        format!("sha256:{}", digest::sha256_file(&layer_tar).unwrap())
    );

    // The image id is the digest of the config file bytes.
    let config_bytes = std::fs::read(&config_path).unwrap();
    assert_eq!(config_bytes.last(), Some(&b'\n'));
    assert_eq!(digest::sha256_bytes(&config_bytes), image_id);

    // Bottom-up first-wins: exactly one a/b.txt carrying the bottom copy.
    let entries = read_tar_entries(&layer_tar);
    let matches: Vec<&(String, Vec<u8>)> =
        entries.iter().filter(|(n, _)| n == "a/b.txt").collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].1, b"v1");

    // History collapsed to the single appended entry, created_by taken
    // from the last original non-empty entry.
    let history = config.history.as_ref().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].created_by, "RUN rewrite b.txt");
    assert_eq!(history[0].comment, "squash image");
    assert!(!history[0].empty_layer);

    // Container field is cleared on emitted configs.
    assert_eq!(config.container, "");

    // Squashed layer directory carries json + VERSION.
    let layer_dir = layer_tar.parent().unwrap();
    assert!(layer_dir.join("json").exists());
    assert_eq!(
        std::fs::read_to_string(layer_dir.join("VERSION")).unwrap(),
        "1.0"
    );

    // repositories maps name -> tag -> leaf of the final layer entry.
    let repos: serde_json::Value =
        serde_json::from_slice(&std::fs::read(extracted.path().join("repositories")).unwrap())
            .unwrap();
    let leaf = manifest.layers[0].split('/').next().unwrap();
    assert_eq!(repos["test"]["squashed"], leaf);

    // The load sink registered the squashed image in the store.
    assert_eq!(store.inspect("test:squashed").unwrap().id, image_id);
}

#[test]
fn test_squash_split_preserves_moved_layers() {
    let store_root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    let bottom_tar = build_layer_tar(&[("base.txt", b"base")]);
    install_image(
        store_root.path(),
        "srcimage02",
        "split:latest",
        &[
            ("layer1", bottom_tar.clone()),
            ("layer2", build_layer_tar(&[("mid.txt", b"mid")])),
            ("layer3", build_layer_tar(&[("top.txt", b"top")])),
        ],
        &["ADD base", "ADD mid", "ADD top"],
    );

    let store = LocalStore::open(store_root.path(), StoreConfig::default()).unwrap();
    let output_tar = work.path().join("out.tar");
    let options = SquashOptions {
        image: "split:latest".to_string(),
        from_layer: Some("2".to_string()),
        message: "squash image".to_string(),
        output_path: Some(output_tar.clone()),
        load_image: false,
        ..Default::default()
    };

    let image_id = Squasher::new(&store, options).run().unwrap();

    let extracted = TempDir::new().unwrap();
    let (manifest, config, _) = read_output(&output_tar, extracted.path());

    // One moved layer plus the squashed one.
    assert_eq!(manifest.layers.len(), 2);
    assert_eq!(manifest.layers[0], "layer1/layer.tar");
    let diff_ids = config.rootfs.diff_ids.as_ref().unwrap();
    assert_eq!(diff_ids.len(), 2);

    // The moved layer tar is byte-identical to the source.
    let moved = std::fs::read(extracted.path().join("layer1/layer.tar")).unwrap();
    assert_eq!(moved, bottom_tar);
    assert_eq!(
        diff_ids[0],
        format!("sha256:{}", digest::sha256_bytes(&moved))
    );

    // Chain-id derivation: the squashed layer's directory id hashes the
    // chain tail, which itself follows chain[i] = H(chain[i-1], diff[i]).
    let squashed_entry = &manifest.layers[1];
    assert!(squashed_entry.ends_with("/layer.tar"));
    let merged = read_tar_entries(&extracted.path().join(squashed_entry));
    let names: Vec<&str> = merged.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["mid.txt", "top.txt"]);

    // Two history entries: the preserved one plus the appended one.
    let history = config.history.as_ref().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].created_by, "ADD base");
    assert_eq!(history[1].created_by, "ADD top");

    // Manifest references the new config.
    assert_eq!(manifest.config, format!("{image_id}.json"));
}

#[test]
fn test_single_layer_image_is_unnecessary_and_cleans_up() {
    let store_root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    install_image(
        store_root.path(),
        "srcimage03",
        "tiny:latest",
        &[("layer1", build_layer_tar(&[("only.txt", b"x")]))],
        &["ADD only"],
    );

    let store = LocalStore::open(store_root.path(), StoreConfig::default()).unwrap();
    let scratch = work.path().join("scratch");
    let options = SquashOptions {
        image: "tiny:latest".to_string(),
        load_image: true,
        cleanup: true,
        tmp_dir: Some(scratch.clone()),
        ..Default::default()
    };

    let err = Squasher::new(&store, options).run().unwrap_err();
    assert!(matches!(err, SquashError::SquashUnnecessary));
    assert_eq!(err.exit_code(), 2);
    assert!(!scratch.exists());
}

#[test]
fn test_invalid_layer_counts() {
    let store_root = TempDir::new().unwrap();

    install_image(
        store_root.path(),
        "srcimage04",
        "bounds:latest",
        &[
            ("layer1", build_layer_tar(&[("a", b"1")])),
            ("layer2", build_layer_tar(&[("b", b"2")])),
        ],
        &["ADD a", "ADD b"],
    );

    let store = LocalStore::open(store_root.path(), StoreConfig::default()).unwrap();

    for from_layer in ["0", "3"] {
        let options = SquashOptions {
            image: "bounds:latest".to_string(),
            from_layer: Some(from_layer.to_string()),
            load_image: true,
            ..Default::default()
        };
        let err = Squasher::new(&store, options).run().unwrap_err();
        assert!(
            matches!(err, SquashError::InvalidLayerCount(_)),
            "from_layer={from_layer} produced {err:?}"
        );
    }
}

#[test]
fn test_resquashing_the_output_is_a_noop() {
    let store_root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();

    install_image(
        store_root.path(),
        "srcimage05",
        "again:latest",
        &[
            ("layer1", build_layer_tar(&[("a", b"1")])),
            ("layer2", build_layer_tar(&[("b", b"2")])),
        ],
        &["ADD a", "ADD b"],
    );

    let store = LocalStore::open(store_root.path(), StoreConfig::default()).unwrap();
    let options = SquashOptions {
        image: "again:latest".to_string(),
        tag: Some("again:squashed".to_string()),
        message: "squash image".to_string(),
        output_path: Some(work.path().join("out.tar")),
        load_image: true,
        ..Default::default()
    };
    Squasher::new(&store, options).run().unwrap();

    // The output is a single-layer image; selecting its whole stack
    // again has nothing to merge.
    let options = SquashOptions {
        image: "again:squashed".to_string(),
        from_layer: Some("1".to_string()),
        load_image: true,
        ..Default::default()
    };
    let err = Squasher::new(&store, options).run().unwrap_err();
    assert!(matches!(err, SquashError::SquashUnnecessary));
}
