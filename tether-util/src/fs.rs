use std::io;
use std::path::Path;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Atomically create a file with the given contents, replacing any
/// previous file at `path`.
///
/// The buffer is written to a sibling temporary file which is synced and
/// then renamed over the destination, so readers see either the old or the
/// new document, never a partial one.
pub async fn safe_write_all<P: AsRef<Path>, B: AsRef<[u8]>>(path: P, buf: B) -> io::Result<()> {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let tmp_path = path.as_ref().with_extension(format!("sync-{suffix}"));

    let mut tmp_file = fs::File::create(&tmp_path).await?;
    tmp_file.write_all(buf.as_ref()).await?;
    tmp_file.flush().await?;
    tmp_file.sync_all().await?;
    drop(tmp_file);

    fs::rename(&tmp_path, path.as_ref()).await
}
