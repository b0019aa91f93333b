use super::*;

#[test]
fn error_when_config_files_cannot_be_read() {
    match Config::from_file("nonexistent.toml") {
        Err(ConfigFileError::IoError { path, .. }) if path == "nonexistent.toml" => {}
        res => panic!("unexpected result: {:?}", res),
    }
}

#[test]
fn empty_config_can_be_read() {
    let config: Config = "".parse().expect("can read empty config");
    assert!(config.services.is_empty());
    assert!(config.sockets.is_empty());
}

#[test]
fn disk_services_can_be_read() {
    let config: Config = r#"
        [[services]]
        name = "site"
        disk = { path = "/srv/www", allow_dotfiles = true }
    "#
    .parse()
    .expect("can read config");

    assert_eq!(config.services.len(), 1);
    assert_eq!(config.services[0].name, "site");
    match config.services[0].kind() {
        ServiceKind::Disk(disk) => {
            assert_eq!(disk.path.as_deref(), Some(Path::new("/srv/www")));
            assert!(disk.allow_dotfiles);
            assert!(!disk.writable);
        }
        _ => panic!("expected a disk service"),
    }
}

#[test]
fn a_service_must_have_exactly_one_kind() {
    let config: Config = r#"
        [[services]]
        name = "confused"
        disk = { path = "/srv/www" }
        network = {}

        [[services]]
        name = "empty"
    "#
    .parse()
    .expect("can read config");

    assert!(matches!(config.services[0].kind(), ServiceKind::Ambiguous));
    assert!(matches!(config.services[1].kind(), ServiceKind::Unspecified));
}

#[test]
fn sockets_parse_with_designators_and_options() {
    let config: Config = r#"
        [[sockets]]
        name = "main"
        address = "*:8080"
        service = "site"

        [[sockets]]
        name = "admin"
        service = { name = "api", entrypoint = "admin" }
        [sockets.http]
        style = "proxy"
        forwarded_proto_header = "X-Forwarded-Proto"
        inject_request_headers = [
            { name = "X-Real-IP", value = "10.0.0.1" },
            { name = "X-Debug" },
        ]
    "#
    .parse()
    .expect("can read config");

    let main = &config.sockets[0];
    assert_eq!(main.service.name(), "site");
    assert_eq!(main.service.entrypoint(), None);
    assert!(matches!(main.protocol(), SocketProtocol::Http(None)));

    let admin = &config.sockets[1];
    assert_eq!(admin.service.name(), "api");
    assert_eq!(admin.service.entrypoint(), Some("admin"));
    match admin.protocol() {
        SocketProtocol::Http(Some(options)) => {
            assert_eq!(options.style, HttpStyle::Proxy);
            assert_eq!(
                options.forwarded_proto_header.as_deref(),
                Some("X-Forwarded-Proto")
            );
            assert_eq!(options.inject_request_headers.len(), 2);
            assert_eq!(options.inject_request_headers[0].value.as_deref(), Some("10.0.0.1"));
            assert_eq!(options.inject_request_headers[1].value, None);
        }
        _ => panic!("expected explicit http options"),
    }
}

#[test]
fn https_socket_options_parse() {
    let config: Config = r#"
        [[sockets]]
        name = "tls"
        address = "*:8443"
        service = "site"
        [sockets.https]
        [sockets.https.tls_options]
        min_version = "tls1.3"
        require_client_certs = true
        [sockets.https.tls_options.keypair]
        private_key = "key pem"
        certificate_chain = "cert pem"
    "#
    .parse()
    .expect("can read config");

    match config.sockets[0].protocol() {
        SocketProtocol::Https(https) => {
            assert_eq!(https.tls_options.min_version, TlsVersion::Tls1Dot3);
            assert!(https.tls_options.require_client_certs);
            let keypair = https.tls_options.keypair.as_ref().expect("keypair");
            assert_eq!(keypair.private_key, "key pem");
        }
        _ => panic!("expected an https socket"),
    }
}

#[test]
fn network_allow_defaults_to_public() {
    let config: Config = r#"
        [[services]]
        name = "net"
        network = {}
    "#
    .parse()
    .expect("can read config");

    match config.services[0].kind() {
        ServiceKind::Network(net) => {
            assert_eq!(net.allow, ["public"]);
            assert!(net.deny.is_empty());
            assert!(net.tls_options.is_none());
        }
        _ => panic!("expected a network service"),
    }
}

#[test]
fn worker_bindings_parse() {
    let config: Config = r#"
        [[services]]
        name = "hello"
        [services.worker]
        compatibility_date = "2022-10-31"
        compatibility_flags = ["formdata_parser_supports_files"]
        global_outbound = "proxy"
        modules = [{ name = "main.js", content = "export default {}" }]

        [[services.worker.bindings]]
        name = "GREETING"
        text = "hi"

        [[services.worker.bindings]]
        name = "backend"
        service = "api"

        [[services.worker.bindings]]
        name = "KEY"
        [services.worker.bindings.crypto_key]
        hex = "deadbeef"
        algorithm = "AES-GCM"
        usages = ["encrypt"]
    "#
    .parse()
    .expect("can read config");

    let worker = match config.services[0].kind() {
        ServiceKind::Worker(worker) => worker,
        _ => panic!("expected a worker service"),
    };
    assert_eq!(worker.compatibility_date.as_deref(), Some("2022-10-31"));
    assert_eq!(worker.global_outbound.name(), "proxy");
    assert_eq!(worker.modules[0].module_type, ModuleType::EsModule);

    assert!(matches!(worker.bindings[0].kind(), BindingKind::Text("hi")));
    match worker.bindings[1].kind() {
        BindingKind::Service(designator) => assert_eq!(designator.name(), "api"),
        _ => panic!("expected a service binding"),
    }
    match worker.bindings[2].kind() {
        BindingKind::CryptoKey(key) => {
            assert!(matches!(key.format(), CryptoKeyFormat::Hex("deadbeef")));
            assert!(matches!(
                key.algorithm,
                Some(AlgorithmConf::Name(ref name)) if name == "AES-GCM"
            ));
            assert!(!key.extractable);
        }
        _ => panic!("expected a crypto key binding"),
    }
}

#[test]
fn global_outbound_defaults_to_internet() {
    let config: Config = r#"
        [[services]]
        name = "hello"
        worker = { compatibility_date = "2022-10-31" }
    "#
    .parse()
    .expect("can read config");

    match config.services[0].kind() {
        ServiceKind::Worker(worker) => assert_eq!(worker.global_outbound.name(), "internet"),
        _ => panic!("expected a worker service"),
    }
}

#[test]
fn unrecognized_keys_are_rejected() {
    let result: Result<Config, _> = r#"
        [[services]]
        name = "site"
        disk = { path = "/srv/www", writeable = true }
    "#
    .parse();
    assert!(result.is_err());
}
