//! Metric naming. These names are what results get compared by across runs,
//! so they must stay stable.

use crate::build::Compiler;

/// Suffix of the peak-memory companion of a timing metric
pub const MEM_USAGE_SUFFIX: &str = ".mem-usage";

/// Height label used when a run reaches the chain tip without an end height
pub const TIP_LABEL: &str = "tip";

pub fn ibd_real(height: &str, dbcache: u64) -> String {
    format!("ibd.real.{height}.dbcache={dbcache}")
}

pub fn ibd_local(height: &str, dbcache: u64) -> String {
    format!("ibd.local.{height}.dbcache={dbcache}")
}

pub fn ibd_local_range(start_height: u64, height: &str, dbcache: u64) -> String {
    format!("ibd.local.{start_height}.{height}.dbcache={dbcache}")
}

pub fn reindex(height: &str, dbcache: u64) -> String {
    format!("reindex.{height}.dbcache={dbcache}")
}

pub fn make(jobs: usize, compiler: Compiler) -> String {
    format!("build.make.{jobs}.{compiler}")
}

pub fn make_check(compiler: Compiler, jobs: usize) -> String {
    format!("makecheck.{compiler}.{jobs}")
}

pub fn functional_tests(compiler: Compiler) -> String {
    format!("functionaltests.{compiler}")
}

pub fn micro(compiler: Compiler, bench: &str) -> String {
    format!("micro.{compiler}.{bench}")
}

pub fn mem_usage(name: &str) -> String {
    format!("{name}{MEM_USAGE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(ibd_local("500100", 2048), "ibd.local.500100.dbcache=2048");
        assert_eq!(ibd_real(TIP_LABEL, 512), "ibd.real.tip.dbcache=512");
        assert_eq!(
            ibd_local_range(500000, "500100", 300),
            "ibd.local.500000.500100.dbcache=300"
        );
        assert_eq!(reindex("200", 450), "reindex.200.dbcache=450");
        assert_eq!(make(8, Compiler::Clang), "build.make.8.clang");
        assert_eq!(
            mem_usage(&make(1, Compiler::Gcc)),
            "build.make.1.gcc.mem-usage"
        );
        assert_eq!(micro(Compiler::Gcc, "DeserializeBlockTest"), "micro.gcc.DeserializeBlockTest");
    }
}
