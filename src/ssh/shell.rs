// ABOUTME: Helpers for composing POSIX shell commands sent to target hosts.
// ABOUTME: Single-quote escaping plus atomic file write, backup and restore one-liners.

/// Quote `value` as a single shell word.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Write `contents` to `path` via a temp file and rename, so readers never see half a file.
pub fn write_file(path: &str, contents: &str) -> String {
    let tmp = format!("{}.shipwright-tmp", path);
    format!(
        "mkdir -p \"$(dirname {path})\" && printf '%s' {body} > {tmp} && mv -f {tmp} {path}",
        path = quote(path),
        body = quote(contents),
        tmp = quote(&tmp),
    )
}

/// Path of the backup kept by [`backup_file`].
pub fn backup_path(path: &str) -> String {
    format!("{}.shipwright-bak", path)
}

/// Path recording which run owns the backup of `path`.
pub fn backup_owner_path(path: &str) -> String {
    format!("{}.shipwright-run", path)
}

/// Copy `path` aside the first time `owner` touches it.
///
/// Later calls with the same owner keep the original backup, so retries and
/// resumes never replace it with a half-deployed version. A missing file is
/// recorded too, so restoring removes what was created.
pub fn backup_file(path: &str, owner: &str) -> String {
    format!(
        "mkdir -p \"$(dirname {path})\" && \
         if [ \"$(cat {run} 2>/dev/null)\" != {owner} ]; then \
         if [ -f {path} ]; then cp -p {path} {bak}; else rm -f {bak}; fi && \
         printf '%s' {owner} > {run}; fi",
        path = quote(path),
        bak = quote(&backup_path(path)),
        run = quote(&backup_owner_path(path)),
        owner = quote(owner),
    )
}

/// Undo the change `owner` recorded with [`backup_file`].
///
/// Puts the backup back, or removes the file if there was none before. Does
/// nothing when `owner` holds no backup, so a second restore is harmless and
/// a backup left by another run is never applied.
pub fn restore_file(path: &str, owner: &str) -> String {
    format!(
        "if [ \"$(cat {run} 2>/dev/null)\" = {owner} ]; then \
         if [ -f {bak} ]; then mv -f {bak} {path}; else rm -f {path}; fi && \
         rm -f {run}; fi",
        path = quote(path),
        bak = quote(&backup_path(path)),
        run = quote(&backup_owner_path(path)),
        owner = quote(owner),
    )
}
