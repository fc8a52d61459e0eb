use super::*;

#[test]
fn normalizes_known_vendor_states() {
    assert_eq!(normalize_device_status("online"), STATUS_ONLINE);
    assert_eq!(normalize_device_status("LOCKED"), STATUS_ONLINE);
    assert_eq!(normalize_device_status("opened"), STATUS_ONLINE);
    assert_eq!(normalize_device_status("offline"), STATUS_OFFLINE);
    assert_eq!(normalize_device_status("Disconnected"), STATUS_OFFLINE);
}

#[test]
fn unknown_vendor_state_is_permissive() {
    assert_eq!(normalize_device_status("frobnicating"), STATUS_ONLINE);
}
