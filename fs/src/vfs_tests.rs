//! Typed mount tree regression tests.

use keel_lib::testing::TestResult;
use keel_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::vfs::{VfsError, VfsTree};

static TAU: f32 = 6.28;
static ANSWER: u64 = 42;

pub fn test_typed_mount_and_get() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/proc/floats/tau", &TAU, "a well rounded constant", true)
        .unwrap();

    match tree.get::<f32>("/proc/floats/tau") {
        Ok(value) => assert_eq_test!(*value, 6.28, "value round-trips"),
        Err(e) => return fail!("get failed: {:?}", e),
    }
    pass!()
}

pub fn test_get_with_wrong_type_is_bad_cast() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/proc/floats/tau", &TAU, "", true).unwrap();

    assert_eq_test!(
        tree.get::<u64>("/proc/floats/tau").err(),
        Some(VfsError::BadCast),
        "type mismatch"
    );
    pass!()
}

pub fn test_constness_is_preserved() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/proc/floats/tau", &TAU, "", true).unwrap();

    // A const mount can never be retrieved mutably.
    assert_eq_test!(
        tree.get_mut::<f32>("/proc/floats/tau").err(),
        Some(VfsError::BadCast),
        "const object refuses mutable access"
    );
    assert_test!(tree.get::<f32>("/proc/floats/tau").is_ok(), "shared access fine");
    pass!()
}

pub fn test_duplicate_mount_is_invalid() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/proc/floats/tau", &TAU, "", true).unwrap();
    assert_eq_test!(
        tree.mount("/proc/floats/tau", &TAU, "", true).err(),
        Some(VfsError::MountpointInvalid),
        "occupied mount point"
    );
    pass!()
}

pub fn test_mount_without_create_needs_parents() -> TestResult {
    let mut tree = VfsTree::new();
    assert_eq_test!(
        tree.mount("/deep/path/obj", &ANSWER, "", false).err(),
        Some(VfsError::MountpointInvalid),
        "missing parents without create"
    );
    tree.mount("/deep/path/obj", &ANSWER, "", true).unwrap();
    assert_test!(tree.get::<u64>("/deep/path/obj").is_ok(), "created parents");
    pass!()
}

pub fn test_get_errors_by_node_shape() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/sensors/temp", &ANSWER, "", true).unwrap();

    assert_eq_test!(
        tree.get::<u64>("/sensors/none").err(),
        Some(VfsError::NotFound),
        "missing leaf"
    );
    // "/sensors" exists but is a directory node with no object.
    assert_eq_test!(
        tree.get::<u64>("/sensors").err(),
        Some(VfsError::NotLeaf),
        "directory holds no object"
    );
    pass!()
}

pub fn test_walk_and_child_count() -> TestResult {
    let mut tree = VfsTree::new();
    tree.mount("/dev/null0", &ANSWER, "", true).unwrap();
    tree.mount("/dev/null1", &ANSWER, "", true).unwrap();
    tree.mount("/dev/sub/leaf", &ANSWER, "", true).unwrap();

    assert_test!(tree.walk("/dev").is_some(), "intermediate exists");
    assert_test!(tree.walk("/nosuch").is_none(), "missing path");
    assert_eq_test!(tree.child_count("/dev"), Ok(3), "three children of /dev");
    assert_eq_test!(tree.child_count("/"), Ok(1), "one child of root");
    pass!()
}

static mut COUNTER_OBJ: u32 = 0;

pub fn test_mutable_mount_allows_get_mut() -> TestResult {
    let mut tree = VfsTree::new();
    let counter = unsafe { &mut *(&raw mut COUNTER_OBJ) };
    tree.mount_mut("/state/counter", counter, "", true).unwrap();

    match tree.get_mut::<u32>("/state/counter") {
        Ok(value) => {
            *value += 5;
        }
        Err(e) => return fail!("get_mut failed: {:?}", e),
    }
    assert_eq_test!(
        tree.get::<u32>("/state/counter").map(|v| *v),
        Ok(5),
        "mutation visible through shared get"
    );
    pass!()
}

define_test_suite!(
    vfs,
    [
        test_typed_mount_and_get,
        test_get_with_wrong_type_is_bad_cast,
        test_constness_is_preserved,
        test_duplicate_mount_is_invalid,
        test_mount_without_create_needs_parents,
        test_get_errors_by_node_shape,
        test_walk_and_child_count,
        test_mutable_mount_allows_get_mut,
    ]
);
