//! End-to-end session runs over a temporary source tree.

use std::fs;
use std::path::Path;

use refit::config::CONFIG_FILE;
use refit::{ExitCode, RefitError, Session};

const KERNEL: &str = "\
module kernel_mod
  implicit none
contains
  subroutine scale(a, n)
    integer, intent(in) :: n
    real, intent(inout) :: a(n)
    integer :: i
    call timer_start()
    do i = 1, n
      a(i) = 2.0 * a(i)
    end do
  end subroutine scale
end module kernel_mod
";

const DRIVER: &str = "\
program driver
  use kernel_mod
  implicit none
  real :: x(4)
  x = 1.0
  call scale(x, 4)
end program driver
";

const PING: &str = "\
subroutine ping(n)
  implicit none
  integer, intent(in) :: n
  integer :: i
  do i = 1, n
    if (i > 2) call pong(n - 1)
  end do
end subroutine ping
";

const PONG: &str = "\
subroutine pong(n)
  implicit none
  integer, intent(in) :: n
  integer :: i
  do i = 1, n
    if (i > 3) call ping(n - 1)
  end do
end subroutine pong
";

fn write(root: &Path, path: &str, text: &str) {
    let full = root.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(full, text).unwrap();
}

#[test]
fn configured_run_rewrites_and_writes_back() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "src/kernel.f90", KERNEL);
    write(root, "src/driver.f90", DRIVER);
    write(root, "src/notes.txt", "not fortran");
    write(
        root,
        CONFIG_FILE,
        r#"
write = true

[scheduler]
workers = 2

[[passes]]
name = "remove-calls"
options = { names = ["timer_start"] }

[[passes]]
name = "annotate-loops"
options = { directive = "!$acc loop vector", variable = "i" }
"#,
    );

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();

    assert_eq!(summary.files, 2);
    assert_eq!(summary.parsed, 2);
    assert_eq!(summary.passes.len(), 2);
    assert_eq!(summary.exit_code(), ExitCode::Success, "{:?}", summary);
    assert_eq!(summary.written, vec!["src/kernel.f90"]);

    let kernel = fs::read_to_string(root.join("src/kernel.f90")).unwrap();
    let expected = KERNEL
        .replace("    call timer_start()\n", "")
        .replace("    do i = 1, n\n", "    !$acc loop vector\n    do i = 1, n\n");
    assert_eq!(kernel, expected);
    assert_eq!(fs::read_to_string(root.join("src/driver.f90")).unwrap(), DRIVER);
}

#[test]
fn dry_run_leaves_files_alone() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "kernel.f90", KERNEL);
    write(
        root,
        CONFIG_FILE,
        "[[passes]]\nname = \"remove-calls\"\noptions = { names = [\"timer_start\"] }\n",
    );

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    assert_eq!(summary.changed, vec!["kernel.f90"]);
    assert!(summary.written.is_empty());
    assert_eq!(fs::read_to_string(root.join("kernel.f90")).unwrap(), KERNEL);
}

/// Outcome of a rename over the ping/pong cycle in a fresh tree.
fn rename_cycle() -> (Option<String>, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "ping.f90", PING);
    write(root, "pong.f90", PONG);
    write(
        root,
        CONFIG_FILE,
        "write = true\n\n[[passes]]\nname = \"rename-routines\"\noptions = { suffix = \"_v2\" }\n",
    );

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    let texts = ["ping.f90", "pong.f90"]
        .iter()
        .map(|f| fs::read_to_string(root.join(f)).unwrap())
        .collect();
    (summary.scheduling_error.map(|e| e.to_string()), texts)
}

#[test]
fn mutual_recursion_terminates_deterministically() {
    let first = rename_cycle();
    assert_eq!(first, rename_cycle());

    let (error, texts) = first;
    match error {
        None => {
            assert!(texts[0].contains("subroutine ping_v2(n)"), "{}", texts[0]);
            assert!(texts[0].contains("call pong_v2(n - 1)"), "{}", texts[0]);
            assert!(texts[1].contains("call ping_v2(n - 1)"), "{}", texts[1]);
        }
        Some(message) => {
            assert!(message.contains("did not converge"), "{}", message);
            // Nothing is written after a stopped pass.
            assert_eq!(texts, vec![PING.to_string(), PONG.to_string()]);
        }
    }
}

const KERNELS: &str = "\
module kernels
  implicit none
contains
  subroutine kernel(a, n)
    integer, intent(in) :: n
    real, intent(inout) :: a(n)
    a = 2.0 * a
  end subroutine kernel
end module kernels
";

const CALLER: &str = "\
program caller
  use kernels, only: kernel
  implicit none
  real :: x(4)
  x = 1.0
  call kernel(x, 4)
end program caller
";

const DUPLICATE: &str = "[[passes]]\nname = \"duplicate-routines\"\noptions = { routines = [\"kernel\"] }\n";

#[test]
fn duplicated_kernel_is_called_next_to_the_original() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "kernels.f90", KERNELS);
    write(root, "caller.f90", CALLER);
    write(root, CONFIG_FILE, &format!("write = true\n\n{}", DUPLICATE));

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    assert_eq!(summary.exit_code(), ExitCode::Success, "{:?}", summary);
    assert_eq!(summary.passes[0].changed.len(), 2, "{:?}", summary.passes);

    let kernels = fs::read_to_string(root.join("kernels.f90")).unwrap();
    assert!(kernels.contains("subroutine kernel(a, n)"), "{}", kernels);
    assert!(kernels.contains("subroutine kernel_duplicated(a, n)"), "{}", kernels);
    assert!(kernels.contains("end subroutine kernel_duplicated"), "{}", kernels);
    assert_eq!(kernels.matches("a = 2.0 * a").count(), 2, "{}", kernels);

    let caller = fs::read_to_string(root.join("caller.f90")).unwrap();
    assert!(caller.contains("use kernels, only: kernel_duplicated"), "{}", caller);
    assert!(caller.contains("use kernels, only: kernel\n"), "{}", caller);
    let original = caller.find("call kernel(x, 4)").unwrap();
    let copy = caller.find("call kernel_duplicated(x, 4)").unwrap();
    assert!(original < copy, "{}", caller);
}

#[test]
fn plan_reports_changes_and_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "kernels.f90", KERNELS);
    write(root, "caller.f90", CALLER);
    write(root, CONFIG_FILE, &format!("write = true\nplan = true\n\n{}", DUPLICATE));

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    assert!(summary.passes.is_empty());
    assert!(summary.changed.is_empty());
    assert!(summary.written.is_empty());

    let [plan] = summary.plans.as_slice() else {
        panic!("expected one plan: {:?}", summary.plans);
    };
    assert_eq!(plan.pass, "duplicate-routines");
    let changes: Vec<_> = plan.changes.values().collect();
    assert_eq!(changes.len(), 1, "{:?}", plan.changes);
    assert_eq!(changes[0].added, vec!["kernel_duplicated"]);
    assert!(changes[0].removed.is_empty());
    // Callees come first.
    let position = |name: &str| {
        plan.stages
            .iter()
            .position(|stage| stage.iter().any(|u| u.ends_with(name)))
            .unwrap()
    };
    assert!(position("kernel") < position("caller"), "{:?}", plan.stages);

    assert_eq!(fs::read_to_string(root.join("kernels.f90")).unwrap(), KERNELS);
    assert_eq!(fs::read_to_string(root.join("caller.f90")).unwrap(), CALLER);
}

#[test]
fn lint_findings_respect_configuration_and_markers() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "s.f90",
        "subroutine s(a, b, n)\n  integer, intent(in) :: n\n  real :: a(n)   ! refit: disable=array-intent\n  real :: b(n)\n  stop\nend subroutine s\n",
    );
    write(
        root,
        CONFIG_FILE,
        "[rules.implicit-none]\nseverity = \"off\"\n\n[rules.banned-statements]\nseverity = \"error\"\noptions = { statements = [\"stop\"] }\n",
    );

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    let ids: Vec<_> = summary.diagnostics.iter().map(|d| d.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["array-intent", "banned-statements"], "{:?}", summary.diagnostics);
    assert_eq!(summary.diagnostics[0].line, Some(4));
    assert_eq!(summary.suppressed, 1);
    // Findings are reported, not failures.
    assert_eq!(summary.exit_code(), ExitCode::Success);

    let rendered = session.render_diagnostics(&summary.diagnostics, false);
    assert!(rendered.contains("s.f90:4"), "{}", rendered);
}

#[test]
fn broken_source_sets_parse_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "ok.f90", DRIVER);
    write(root, "bad.f90", "subroutine t\n  do i = 1, 2\nend subroutine t\n");

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    assert_eq!(summary.parsed, 1);
    assert_eq!(summary.parse_errors[0].file, "bad.f90");
    assert_eq!(summary.exit_code(), ExitCode::ParseFailure);
}

#[test]
fn undecodable_file_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let legacy: &[u8] = b"subroutine legacy\n  ! r\xe9sum\xe9\nend subroutine legacy\n";
    write(root, "kernel.f90", KERNEL);
    fs::write(root.join("legacy.f90"), legacy).unwrap();
    write(
        root,
        CONFIG_FILE,
        "write = true\n\n[[passes]]\nname = \"remove-calls\"\noptions = { names = [\"timer_start\"] }\n",
    );

    let mut session = Session::open(root).unwrap();
    let summary = session.run().unwrap();
    assert_eq!((summary.files, summary.parsed), (2, 1));
    assert_eq!(summary.parse_errors.len(), 1);
    assert_eq!(summary.parse_errors[0].file, "legacy.f90");
    assert_eq!(summary.parse_errors[0].line, Some(2));
    assert_eq!(summary.exit_code(), ExitCode::ParseFailure);

    assert_eq!(summary.written, vec!["kernel.f90"]);
    assert!(!fs::read_to_string(root.join("kernel.f90")).unwrap().contains("timer_start"));
    assert_eq!(fs::read(root.join("legacy.f90")).unwrap(), legacy);
}

#[test]
fn invalid_configuration_exits_with_two() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, CONFIG_FILE, "include = [\"src/[\"]\n");
    let err = Session::open(root).err().unwrap();
    assert!(matches!(err, RefitError::Config(_)), "{}", err);
    assert_eq!(err.exit_code(), ExitCode::InvalidConfiguration);

    write(root, CONFIG_FILE, "[[passes]]\nname = \"no-such-pass\"\n");
    let mut session = Session::open(root).unwrap();
    let err = session.run().unwrap_err();
    assert_eq!(err.exit_code(), ExitCode::InvalidConfiguration);
}
