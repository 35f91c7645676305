mod stress;

#[test]
fn stress() {
    stress::stress_test();
}
