//! Local image store: name:tag ⇄ image-ID mapping, on-disk layer trees, and
//! the registry pull pipeline. The registry client (`dkregistry`) and the
//! tar/gzip extraction (`tar`/`flate2`) are treated as the external
//! collaborators spec.md §1 names them as; this module is the glue around
//! them, ported from `image/accessor.go` in the original source with
//! `rocker::image`'s `dkregistry` plumbing reused for the actual pull.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dkregistry::v2::{manifest::Manifest as RegistryManifestKind, Client};
use flate2::read::GzDecoder;
use fs2::FileExt;
use futures::future::join_all;
use log::info;
use serde::{Deserialize, Serialize};
use tar::Archive;

use crate::error::FdockerError;
use crate::ids::ImageId;
use crate::paths::Paths;

const REGISTRY_HOST: &str = "index.docker.io";

/// `<name>/<tag> → imageID`, persisted as `{"<name>": {"<tag>": "<id>"}}`.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDb(BTreeMap<String, BTreeMap<String, String>>);

impl ImageDb {
    pub fn get(&self, name: &str, tag: &str) -> Option<&str> {
        self.0.get(name)?.get(tag).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, tag: &str, image_id: &str) {
        self.0
            .entry(name.to_string())
            .or_default()
            .insert(tag.to_string(), image_id.to_string());
    }

    /// Reverse lookup: first `(name, tag)` whose ID matches, or `("", "")`
    /// when unknown (spec.md §4.E's documented "empty strings" contract).
    pub fn find_by_id(&self, image_id: &str) -> (String, String) {
        for (name, tags) in &self.0 {
            for (tag, id) in tags {
                if id == image_id {
                    return (name.clone(), tag.clone());
                }
            }
        }
        (String::new(), String::new())
    }

    pub fn remove(&mut self, name: &str, tag: &str) {
        if let Some(tags) = self.0.get_mut(name) {
            tags.remove(tag);
            if tags.is_empty() {
                self.0.remove(name);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.0.iter().flat_map(|(name, tags)| {
            tags.iter()
                .map(move |(tag, id)| (name.as_str(), tag.as_str(), id.as_str()))
        })
    }
}

/// Reads the JSON DB, creating an empty `{}` file if absent, while holding
/// a shared advisory lock over the images directory.
fn load_db(paths: &Paths) -> Result<ImageDb> {
    let db_path = paths.images_db_file();
    if !db_path.exists() {
        fs::write(&db_path, b"{}").context("failed to create empty image DB")?;
    }
    let data = fs::read_to_string(&db_path).context("failed to read image DB")?;
    serde_json::from_str(&data).context("failed to parse image DB")
}

/// Atomically rewrites the JSON DB: write to a sibling temp file, `fsync`,
/// then rename over the original. An advisory lock on the images directory
/// serializes concurrent `rmi`/`run` invocations for the duration of the
/// read-modify-write (spec.md §4.E / §9).
fn with_locked_db<T>(paths: &Paths, f: impl FnOnce(&mut ImageDb) -> Result<T>) -> Result<T> {
    fs::create_dir_all(paths.images()).context("failed to create images directory")?;
    let lock_file = File::create(paths.images().join(".lock")).context("failed to open DB lock file")?;
    lock_file
        .lock_exclusive()
        .context("failed to acquire image DB lock")?;

    let mut db = load_db(paths)?;
    let result = f(&mut db)?;
    save_db(paths, &db)?;

    fs2::FileExt::unlock(&lock_file).ok();
    Ok(result)
}

fn save_db(paths: &Paths, db: &ImageDb) -> Result<()> {
    let db_path = paths.images_db_file();
    let tmp_path = paths.images().join("images.json.tmp");
    let json = serde_json::to_vec_pretty(db).context("failed to serialize image DB")?;
    {
        let mut f = File::create(&tmp_path).context("failed to create temp image DB file")?;
        f.write_all(&json)?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, &db_path).context("failed to atomically replace image DB")?;
    Ok(())
}

/// Manifest for one image: an ordered list of layer archive references and
/// a config blob reference. Layer order is significant — see
/// `build_lowerdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigDetails {
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(rename = "config", default)]
    pub config: ConfigDetails,
}

pub fn parse_manifest(path: &Path) -> Result<Manifest> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest: {}", path.display()))?;
    let entries: Vec<Manifest> =
        serde_json::from_str(&data).with_context(|| format!("failed to parse manifest: {}", path.display()))?;
    if entries.len() != 1 {
        return Err(FdockerError::setup(format!(
            "manifest at {} must contain exactly one entry, found {}",
            path.display(),
            entries.len()
        ))
        .into());
    }
    Ok(entries.into_iter().next().unwrap())
}

pub fn parse_container_config(paths: &Paths, image_id: &ImageId) -> Result<ImageConfig> {
    let path = config_path_for_image(paths, image_id);
    let data = fs::read_to_string(&path)
        .with_context(|| format!("failed to read image config: {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("failed to parse image config: {}", path.display()))
}

pub fn manifest_path_for_image(paths: &Paths, image_id: &ImageId) -> PathBuf {
    paths.image_dir(image_id.as_str()).join("manifest.json")
}

fn config_path_for_image(paths: &Paths, image_id: &ImageId) -> PathBuf {
    paths
        .image_dir(image_id.as_str())
        .join(format!("{}.json", image_id.as_str()))
}

/// Builds the overlay `lowerdir=` value: colon-separated, topmost layer
/// leftmost, which is the *reverse* of manifest order.
pub fn build_lowerdir(paths: &Paths, image_id: &ImageId, manifest: &Manifest) -> String {
    let image_base = paths.image_dir(image_id.as_str());
    manifest
        .layers
        .iter()
        .rev()
        .map(|layer| {
            let prefix = layer_prefix(layer);
            image_base.join(prefix).join("fs").display().to_string()
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn layer_prefix(layer_ref: &str) -> &str {
    // Layer refs look like "<64-hex-sha>/layer.tar"; the directory name we
    // extract into is the first 12 characters of that hash.
    let hash = layer_ref.split('/').next().unwrap_or(layer_ref);
    &hash[..12.min(hash.len())]
}

fn split_image_ref(image_ref: &str) -> (String, String) {
    match image_ref.split_once(':') {
        Some((name, tag)) => (name.to_string(), tag.to_string()),
        None => (image_ref.to_string(), "latest".to_string()),
    }
}

/// Resolves `ref` to an image ID, pulling and extracting layers only when
/// necessary. Idempotent: a second call with the same `ref` makes no
/// network request and leaves the DB unchanged.
pub async fn download_image_if_required(paths: &Paths, image_ref: &str) -> Result<ImageId> {
    let (name, tag) = split_image_ref(image_ref);

    if let Some(existing) = with_locked_db(paths, |db| Ok(db.get(&name, &tag).map(str::to_string)))? {
        info!("image {}:{} already present, not downloading", name, tag);
        return ImageId::parse(&existing);
    }

    info!("downloading metadata for {}:{}", name, tag);
    let client = Client::configure()
        .registry(REGISTRY_HOST)
        .insecure_registry(false)
        .build()
        .context("failed to build registry client")?;
    let login_scope = format!("repository:{}:pull", name);
    let authed = client
        .authenticate(&[&login_scope])
        .await
        .context("failed to authenticate with registry")?;
    let manifest = authed
        .get_manifest(&name, &tag)
        .await
        .context("failed to fetch manifest")?;

    let (config_digest, layer_digests): (String, Vec<String>) = match manifest {
        RegistryManifestKind::S2(m) => (m.manifest_spec.config().digest.clone(), m.get_layers()),
        _ => return Err(FdockerError::setup(format!("unsupported manifest schema for {}", image_ref)).into()),
    };
    let config_hash = config_digest.strip_prefix("sha256:").unwrap_or(&config_digest);
    let image_id = ImageId::from_digest_hex(config_hash)?;

    let alias = with_locked_db(paths, |db| Ok(db.find_by_id(image_id.as_str())))?;
    if !alias.0.is_empty() {
        info!(
            "the image you requested {}:{} is the same as {}:{}",
            name, tag, alias.0, alias.1
        );
        with_locked_db(paths, |db| {
            db.insert(&name, &tag, image_id.as_str());
            Ok(())
        })?;
        return Ok(image_id);
    }

    info!("image doesn't exist locally, downloading...");
    pull_and_extract(
        paths,
        &authed,
        &name,
        &tag,
        &image_id,
        &config_digest,
        config_hash,
        &layer_digests,
    )
    .await?;
    with_locked_db(paths, |db| {
        db.insert(&name, &tag, image_id.as_str());
        Ok(())
    })?;
    Ok(image_id)
}

fn digest_prefix12(digest: &str) -> &str {
    let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hash[..12.min(hash.len())]
}

#[allow(clippy::too_many_arguments)]
async fn pull_and_extract(
    paths: &Paths,
    client: &Client,
    name: &str,
    tag: &str,
    image_id: &ImageId,
    config_digest: &str,
    config_hash: &str,
    layer_digests: &[String],
) -> Result<()> {
    let tmp_dir = paths.tmp().join(image_id.as_str());
    fs::create_dir_all(&tmp_dir).context("failed to create temp image directory")?;

    let config_blob = client
        .get_blob(name, config_digest)
        .await
        .context("failed to fetch image config blob")?;
    fs::write(tmp_dir.join(format!("{}.json", config_hash)), &config_blob)
        .context("failed to stage image config blob")?;

    let pulls = layer_digests.iter().map(|digest| {
        let tmp_dir = tmp_dir.clone();
        let digest = digest.clone();
        async move {
            let blob = client.get_blob(name, &digest).await?;
            let short = digest_prefix12(&digest).to_string();
            let mut file = File::create(tmp_dir.join(format!("{}.tar.gz", short)))?;
            file.write_all(&blob)?;
            Ok::<(), anyhow::Error>(())
        }
    });
    join_all(pulls)
        .await
        .into_iter()
        .collect::<Result<Vec<()>>>()
        .context("failed to pull one or more layers")?;

    let image_dir = paths.image_dir(image_id.as_str());
    fs::create_dir_all(&image_dir).context("failed to create image directory")?;

    let mut manifest_layers = Vec::with_capacity(layer_digests.len());
    for digest in layer_digests {
        let short = digest_prefix12(digest);
        let tar_gz = File::open(tmp_dir.join(format!("{}.tar.gz", short)))
            .with_context(|| format!("failed to open layer archive for {}", short))?;
        let dst = image_dir.join(short).join("fs");
        fs::create_dir_all(&dst)?;
        Archive::new(GzDecoder::new(tar_gz))
            .unpack(&dst)
            .with_context(|| format!("failed to extract layer {}", short))?;
        let full_hash = digest.strip_prefix("sha256:").unwrap_or(digest);
        manifest_layers.push(format!("{}/layer.tar", full_hash));
    }

    let manifest = Manifest {
        config: format!("{}.json", config_hash),
        repo_tags: vec![format!("{}:{}", name, tag)],
        layers: manifest_layers,
    };
    fs::write(
        image_dir.join("manifest.json"),
        serde_json::to_vec_pretty(&[&manifest])?,
    )
    .context("failed to write manifest.json next to the extracted layers")?;
    fs::copy(
        tmp_dir.join(format!("{}.json", config_hash)),
        config_path_for_image(paths, image_id),
    )
    .context("failed to copy config blob next to the extracted layers")?;

    fs::remove_dir_all(&tmp_dir).context("failed to remove temp image files")?;
    Ok(())
}

pub fn get_image_and_tag_by_hash(paths: &Paths, image_id: &str) -> Result<(String, String)> {
    with_locked_db(paths, |db| Ok(db.find_by_id(image_id)))
}

/// Removes the on-disk layer tree and the DB entry. Caller must verify no
/// running container uses this image first (spec.md §4.E).
pub fn delete_image_by_hash(paths: &Paths, image_id: &str) -> Result<()> {
    let image_dir = paths.image_dir(image_id);
    fs::remove_dir_all(&image_dir)
        .with_context(|| format!("failed to remove image directory: {}", image_dir.display()))?;
    with_locked_db(paths, |db| {
        let (name, _) = db.find_by_id(image_id);
        if name.is_empty() {
            return Err(anyhow!("could not get image details for {}", image_id));
        }
        let tags: Vec<String> = db
            .iter()
            .filter(|(n, _, id)| *n == name && *id == image_id)
            .map(|(_, tag, _)| tag.to_string())
            .collect();
        for tag in tags {
            db.remove(&name, &tag);
        }
        Ok(())
    })
}

pub fn print_available_images(paths: &Paths) -> Result<()> {
    let db = load_db(paths)?;
    println!("IMAGE\t\tTAG\tIMAGE ID");
    let mut by_name: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
    for (name, tag, id) in db.iter() {
        by_name.entry(name).or_default().push((tag, id));
    }
    for (name, mut tags) in by_name {
        tags.sort();
        println!("{}", name);
        for (tag, id) in tags {
            println!("\t{}\t{}", tag, id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_round_trips_through_json() {
        let mut db = ImageDb::default();
        db.insert("ubuntu", "20.04", "0123456789ab");
        db.insert("ubuntu", "latest", "0123456789ab");
        let json = serde_json::to_string(&db).unwrap();
        let back: ImageDb = serde_json::from_str(&json).unwrap();
        assert_eq!(db, back);
    }

    #[test]
    fn find_by_id_is_inverse_of_insert() {
        let mut db = ImageDb::default();
        db.insert("ubuntu", "20.04", "0123456789ab");
        assert_eq!(db.find_by_id("0123456789ab"), ("ubuntu".to_string(), "20.04".to_string()));
        assert_eq!(db.find_by_id("missing"), (String::new(), String::new()));
    }

    #[test]
    fn removing_last_tag_drops_the_name_entry() {
        let mut db = ImageDb::default();
        db.insert("alpine", "3", "aaaaaaaaaaaa");
        db.remove("alpine", "3");
        assert_eq!(db.find_by_id("aaaaaaaaaaaa"), (String::new(), String::new()));
        assert!(db.iter().next().is_none());
    }

    #[test]
    fn lowerdir_is_reverse_manifest_order() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::under(dir.path());
        let image_id = ImageId::parse("0123456789ab").unwrap();
        let manifest = Manifest {
            config: "cfg.json".into(),
            repo_tags: vec![],
            layers: vec![
                "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa/layer.tar".into(),
                "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb/layer.tar".into(),
                "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc/layer.tar".into(),
            ],
        };
        let lowerdir = build_lowerdir(&paths, &image_id, &manifest);
        let parts: Vec<&str> = lowerdir.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].contains("cccccccccccc"));
        assert!(parts[1].contains("bbbbbbbbbbbb"));
        assert!(parts[2].contains("aaaaaaaaaaaa"));
    }

    #[test]
    fn split_image_ref_defaults_tag_to_latest() {
        assert_eq!(split_image_ref("ubuntu"), ("ubuntu".to_string(), "latest".to_string()));
        assert_eq!(split_image_ref("ubuntu:20.04"), ("ubuntu".to_string(), "20.04".to_string()));
    }
}
