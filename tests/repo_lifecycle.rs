//! Repository lifecycle integration tests: scanning the two-level root,
//! creating and removing canonical/shadow pairs, and URL resolution.
//! These run the real `git` binary inside temporary directories.

use std::fs;
use std::path::Path;

use tempfile::tempdir;

use adit::config::Config;
use adit::error::AppError;
use adit::repos::RepoStore;

fn config_at(root: &Path) -> Config {
    Config {
        http_addr: String::new(),
        repo_root: root.join("repo"),
        review_root: root.join("review"),
        secret: "sekrit".to_string(),
    }
}

#[tokio::test]
async fn add_creates_canonical_shadow_and_hook() {
    let tmp = tempdir().unwrap();
    let cfg = config_at(tmp.path());
    let store = RepoStore::new(&cfg);

    store.add_repo("proj").await.unwrap();

    let canonical = cfg.repo_root.join("proj");
    let shadow = cfg.repo_root.join("proj.r");
    assert!(canonical.join("HEAD").is_file(), "canonical store should be a bare repository");
    assert!(shadow.join(".git").is_dir(), "shadow store should be a checkout");
    let hook = fs::read_to_string(canonical.join("hooks/post-receive")).unwrap();
    assert!(hook.contains("git pull origin master"));
    assert!(hook.contains("git branch -f $branch origin/$branch"));

    // Duplicate creation is a validation error.
    assert!(matches!(store.add_repo("proj").await, Err(AppError::UserInput { .. })));
}

#[tokio::test]
async fn name_validation_is_enforced_on_add() {
    let tmp = tempdir().unwrap();
    let store = RepoStore::new(&config_at(tmp.path()));
    for bad in ["", "/abs", "a/b/c", "with.dot", "shadow.r"] {
        assert!(
            matches!(store.add_repo(bad).await, Err(AppError::UserInput { .. })),
            "expected rejection for {:?}",
            bad
        );
    }
}

#[tokio::test]
async fn scan_sorts_groups_by_name_with_ungrouped_last() {
    let tmp = tempdir().unwrap();
    let store = RepoStore::new(&config_at(tmp.path()));
    store.add_repo("zeta").await.unwrap();
    store.add_repo("alpha").await.unwrap();
    store.add_repo("grp/x").await.unwrap();
    store.add_repo("grp/a").await.unwrap();

    let groups = store.scan().await.unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].name, "grp");
    assert_eq!(
        groups[0].repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        vec!["a", "x"]
    );
    assert_eq!(groups[1].name, "", "ungrouped bucket sorts last");
    assert_eq!(
        groups[1].repos.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
        vec!["alpha", "zeta"]
    );
    // Repositories with no commits report an empty last-activity stamp.
    assert_eq!(groups[1].repos[0].updated, "");
}

#[tokio::test]
async fn scan_reports_structural_errors_instead_of_skipping() {
    let tmp = tempdir().unwrap();
    let cfg = config_at(tmp.path());
    let store = RepoStore::new(&cfg);
    store.add_repo("grp/x").await.unwrap();

    // A non-repository leaf at depth 2 violates the two-level invariant.
    fs::create_dir(cfg.repo_root.join("grp/plain")).unwrap();
    assert!(matches!(store.scan().await, Err(AppError::Corrupt { .. })));
    fs::remove_dir(cfg.repo_root.join("grp/plain")).unwrap();

    // A plain file at depth 1 is just as fatal to the listing.
    fs::write(cfg.repo_root.join("stray"), "x").unwrap();
    assert!(matches!(store.scan().await, Err(AppError::Corrupt { .. })));
    fs::remove_file(cfg.repo_root.join("stray")).unwrap();

    // The shadow suffix only exempts directories; a stray file wearing it
    // is still a structural error, at either depth.
    fs::write(cfg.repo_root.join("stray.r"), "x").unwrap();
    assert!(matches!(store.scan().await, Err(AppError::Corrupt { .. })));
    fs::remove_file(cfg.repo_root.join("stray.r")).unwrap();

    fs::write(cfg.repo_root.join("grp/stray.r"), "x").unwrap();
    assert!(matches!(store.scan().await, Err(AppError::Corrupt { .. })));
}

#[tokio::test]
async fn remove_cleans_pair_metadata_and_empty_group() {
    let tmp = tempdir().unwrap();
    let cfg = config_at(tmp.path());
    let store = RepoStore::new(&cfg);

    store.add_repo("grp/solo").await.unwrap();
    fs::create_dir_all(cfg.review_root.join("grp/solo/1.open")).unwrap();
    fs::write(cfg.review_root.join("grp/solo/1.open/TITLE"), "t").unwrap();

    // The group cannot be removed while it still holds a repository.
    assert!(matches!(store.remove_repo("grp").await, Err(AppError::UserInput { .. })));

    store.remove_repo("grp/solo").await.unwrap();
    assert!(!cfg.repo_root.join("grp").exists(), "emptied group directory is removed");
    assert!(!cfg.repo_root.join("grp/solo.r").exists());
    assert!(!cfg.review_root.join("grp").exists(), "review group directory is removed");

    assert!(matches!(
        store.remove_repo("grp/solo").await,
        Err(AppError::NotFound { .. })
    ));
}

#[tokio::test]
async fn url_resolution_prefers_single_segment() {
    let tmp = tempdir().unwrap();
    let store = RepoStore::new(&config_at(tmp.path()));
    store.add_repo("proj").await.unwrap();
    store.add_repo("grp/x").await.unwrap();

    assert_eq!(
        store.resolve("/proj/info/refs").await,
        Some(("proj".to_string(), "/info/refs".to_string()))
    );
    assert_eq!(
        store.resolve("/grp/x/HEAD").await,
        Some(("grp/x".to_string(), "/HEAD".to_string()))
    );
    assert_eq!(
        store.resolve("/grp/x/").await,
        Some(("grp/x".to_string(), "/".to_string()))
    );
    assert_eq!(store.resolve("/nope/HEAD").await, None);
    assert_eq!(store.resolve("/").await, None);
    // The shadow store is internal bookkeeping, not an addressable repository.
    assert_eq!(store.resolve("/proj.r/HEAD").await, None);
}
