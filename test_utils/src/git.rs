use std::{
    env::current_dir,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use git2::{Oid, RepositoryInitOptions, Signature, Time};

pub struct GitTestRepo {
    pub dir: PathBuf,
    pub git_repo: git2::Repository,
    pub delete_dir_on_drop: bool,
}

impl Default for GitTestRepo {
    fn default() -> Self {
        Self::new("main").unwrap()
    }
}

impl GitTestRepo {
    pub fn new(main_branch_name: &str) -> Result<Self> {
        let path = current_dir()?.join(format!("tmpgit-{}", rand::random::<u64>()));
        let git_repo = git2::Repository::init_opts(
            &path,
            RepositoryInitOptions::new()
                .initial_head(main_branch_name)
                .mkpath(true),
        )?;
        // Make sure we have standard diffs for the tests so that user-level
        // config does not make them fail.
        git_repo.config()?.set_bool("diff.mnemonicPrefix", false)?;
        Ok(Self {
            dir: path,
            git_repo,
            delete_dir_on_drop: true,
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let git_repo = git2::Repository::open(path)?;
        Ok(Self {
            dir: path.to_path_buf(),
            git_repo,
            delete_dir_on_drop: false,
        })
    }

    /// Two commits on the initial branch: t1.md then t2.md.
    pub fn populate(&self) -> Result<Oid> {
        fs::write(self.dir.join("t1.md"), "some content")?;
        self.stage_and_commit("add t1.md")?;
        fs::write(self.dir.join("t2.md"), "some content")?;
        self.stage_and_commit("add t2.md")
    }

    pub fn stage_and_commit(&self, message: &str) -> Result<Oid> {
        let prev_oid = self
            .git_repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok());
        let mut index = self.git_repo.index()?;
        index.add_all(["."], git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["."], None)?;
        index.write()?;
        let tree = self.git_repo.find_tree(index.write_tree()?)?;
        let signature = joe_signature();
        let parents: Vec<&git2::Commit> = prev_oid.iter().collect();
        let oid = self.git_repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )?;
        Ok(oid)
    }

    pub fn create_branch(&self, branch_name: &str) -> Result<()> {
        self.git_repo.branch(
            branch_name,
            &self.git_repo.head()?.peel_to_commit()?,
            false,
        )?;
        Ok(())
    }

    pub fn checkout(&self, ref_name: &str) -> Result<Oid> {
        let (object, reference) = self.git_repo.revparse_ext(ref_name)?;
        self.git_repo.checkout_tree(&object, None)?;
        match reference {
            Some(reference) => self
                .git_repo
                .set_head(reference.name().context("reference should have a name")?)?,
            None => self.git_repo.set_head_detached(object.id())?,
        }
        Ok(object.peel_to_commit()?.id())
    }

    /// Oldest commit reachable from HEAD, as a hex string.
    pub fn initial_commit_id(&self) -> Result<String> {
        let mut revwalk = self.git_repo.revwalk()?;
        revwalk.push(self.git_repo.head()?.peel_to_commit()?.id())?;
        let oid = revwalk
            .last()
            .context("revwalk from HEAD should contain at least one commit")??;
        Ok(oid.to_string())
    }
}

pub fn joe_signature() -> Signature<'static> {
    Signature::new("Joe Bloggs", "joe.bloggs@pm.me", &Time::new(0, 0)).unwrap()
}

impl Drop for GitTestRepo {
    fn drop(&mut self) {
        if self.delete_dir_on_drop {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }
}
