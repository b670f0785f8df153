use bariatric_cloud::logging::init_logging;

#[test]
fn second_init_is_a_no_op() {
    init_logging("bariatric_cloud=debug");
    assert!(!init_logging("bariatric_cloud=trace"));
}
