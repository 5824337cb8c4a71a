fn main() {
    // 只有交叉编译到 ESP-IDF 时才需要导出 sysenv
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
