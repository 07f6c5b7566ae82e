//! Deciding whether a stored record can stand in for a live call.

use std::sync::Arc;

use tracing::trace;

use crate::env::Environment;
use crate::key::ArgsKey;
use crate::record::MemoRecord;
use crate::table::FuncMemoInfo;

/// Find the first record for `key` that is valid in `env`.
///
/// The table's code dependencies are checked first; if they no longer hold,
/// the table is invalidated and the lookup misses. Otherwise the candidates
/// sharing the key are scanned in insertion order, so the earliest valid
/// record wins when several would qualify.
pub fn lookup<'a>(
    table: &'a mut FuncMemoInfo,
    key: &ArgsKey,
    env: &dyn Environment,
) -> Option<&'a Arc<MemoRecord>> {
    if !table.verify_code_dependencies(env) {
        return None;
    }

    let table: &'a FuncMemoInfo = table;
    table.candidates(key).find(|record| {
        let valid = is_valid(record, env);
        if !valid {
            trace!(function = table.name(), "rejected candidate record");
        }
        valid
    })
}

/// Whether a record's declared dependencies match the live state.
///
/// Absent fields impose no constraint. Only the globals and files the record
/// declares are queried.
pub fn is_valid(record: &MemoRecord, env: &dyn Environment) -> bool {
    let globals_match = record.global_vars_read.as_ref().is_none_or(|globals| {
        globals
            .iter()
            .all(|(name, value)| env.global_value(name).as_ref() == Some(value))
    });

    globals_match
        && record.files_read.as_ref().is_none_or(|files| {
            files
                .iter()
                .all(|(path, &mtime)| env.file_mtime(path) == Some(mtime))
        })
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, SystemTime};

    use super::*;
    use crate::codec::{self, Fingerprint};
    use crate::env::Snapshot;
    use crate::record::{FileTimes, GlobalReads, RetBox};
    use crate::table::CodeDependencies;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn record(ret: i32) -> MemoRecord {
        MemoRecord {
            args: ArgsKey::encode(&(3,)).unwrap(),
            global_vars_read: None,
            files_read: None,
            files_written: None,
            retval: RetBox::encode(&ret).unwrap(),
            stdout_buf: None,
            stderr_buf: None,
            final_file_seek_pos: None,
            runtime_ms: 1,
        }
    }

    fn with_global(ret: i32, name: &str, value: i32) -> MemoRecord {
        let globals = GlobalReads::from([(name.to_string(), codec::encode(&value).unwrap())]);
        MemoRecord { global_vars_read: Some(globals), ..record(ret) }
    }

    fn ret(record: Option<&Arc<MemoRecord>>) -> Option<i32> {
        record.map(|r| r.retval.decode().unwrap())
    }

    #[test]
    fn test_absent_fields_match_unconditionally() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(record(9));
        let key = ArgsKey::encode(&(3,)).unwrap();
        let mut env = Snapshot::isolated();
        env.set_global("unrelated", &1).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(9));
    }

    #[test]
    fn test_empty_fields_match_unconditionally() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(MemoRecord {
            global_vars_read: Some(GlobalReads::new()),
            files_read: Some(FileTimes::new()),
            ..record(9)
        });
        let key = ArgsKey::encode(&(3,)).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &Snapshot::isolated())), Some(9));
    }

    #[test]
    fn test_unknown_key_misses() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(record(9));
        let key = ArgsKey::encode(&(4,)).unwrap();
        assert!(lookup(&mut table, &key, &Snapshot::isolated()).is_none());
    }

    #[test]
    fn test_multi_binding() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(with_global(10, "g", 1));
        table.insert(with_global(20, "g", 2));
        let key = ArgsKey::encode(&(3,)).unwrap();

        let mut env = Snapshot::isolated();
        env.set_global("g", &2).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(20));
        env.set_global("g", &1).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(10));
        env.set_global("g", &3).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &env)), None);
        env.unset_global("g");
        assert_eq!(ret(lookup(&mut table, &key, &env)), None);
    }

    #[test]
    fn test_earliest_valid_record_wins() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(with_global(10, "g", 1));
        table.insert(record(20));
        table.insert(record(30));
        let key = ArgsKey::encode(&(3,)).unwrap();

        let mut env = Snapshot::isolated();
        env.set_global("g", &1).unwrap();
        for _ in 0..3 {
            assert_eq!(ret(lookup(&mut table, &key, &env)), Some(10));
        }
        env.set_global("g", &5).unwrap();
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(20));
    }

    #[test]
    fn test_miss_on_file_drift() {
        let mut table = FuncMemoInfo::new("f");
        table.insert(MemoRecord {
            files_read: Some(FileTimes::from([("a.txt".into(), at(100))])),
            ..record(9)
        });
        let key = ArgsKey::encode(&(3,)).unwrap();

        let mut env = Snapshot::isolated();
        env.set_file("a.txt", at(100));
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(9));
        env.set_file("a.txt", at(101));
        assert_eq!(ret(lookup(&mut table, &key, &env)), None);
        env.remove_file(Path::new("a.txt"));
        assert_eq!(ret(lookup(&mut table, &key, &env)), None);
    }

    #[test]
    fn test_code_change_invalidates() {
        let mut table = FuncMemoInfo::new("f");
        table.merge_code_dependencies(&CodeDependencies::from([(
            "f".to_string(),
            Fingerprint::of("v1"),
        )]));
        table.insert(record(9));
        let key = ArgsKey::encode(&(3,)).unwrap();

        let mut env = Snapshot::isolated();
        env.set_code("f", Fingerprint::of("v1"));
        assert_eq!(ret(lookup(&mut table, &key, &env)), Some(9));

        env.set_code("f", Fingerprint::of("v2"));
        assert_eq!(ret(lookup(&mut table, &key, &env)), None);
        assert!(table.is_empty());
    }
}
