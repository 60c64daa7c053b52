use jiff::civil::date;
use keyrelease::testing::{FakeKey, MemoryBackend};
use keyrelease::{
    Config, InheritOptions, KeyId, KeyRecord, MailingList, MemoryStore, Peer, Policy,
    ReleaseSource, Store,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_toml_str(
        r#"
        [release]
        retention = 3
        "#,
    )?;

    let mut backend = MemoryBackend::new();
    let mut store = MemoryStore::new();

    let ca_id = KeyId::new(0xca);
    backend.add(ca_id, FakeKey::new("Certification", "ca@example.org"));
    let ca = KeyRecord::from_backend(&backend, ca_id)?;
    store.save_key(ca.clone())?;

    let policy = Policy::new("2020", date(2020, 1, 1), ca.clone(), 2048, 365, [])
        .with_description("yearly keys of at least 2048 bits");
    let list = store.save_mailing_list(
        MailingList::new("zapatistas", "zapatistas@example.org").with_policy(policy),
    )?;
    println!("policy {}", list.policy().map(ToString::to_string).unwrap_or_default());

    let mut member = |name: &str, id: u64, expires| -> Result<KeyRecord, keyrelease::Error> {
        let peer = store.save_peer(Peer::new(name))?;
        let key_id = KeyId::new(id);
        backend.add(
            key_id,
            FakeKey::new(name, format!("{}@example.org", name.to_lowercase()))
                .expires(expires)
                .signed_by(ca_id),
        );
        let key = KeyRecord::from_backend(&backend, key_id)?
            .with_peer(peer.id().expect("store assigns peer ids"));
        store.save_key(key.clone())?;
        Ok(key)
    };
    let phil = member("Phil", 1, date(2020, 6, 1))?;
    let toto = member("Toto", 2, date(2020, 9, 1))?;
    let lola = member("Lola", 3, date(2020, 12, 1))?;

    let mut first = list.new_release(
        &backend,
        &mut store,
        Some(date(2020, 1, 1)),
        ReleaseSource::Empty,
        config.inherit_options(),
    )?;
    for key in [&phil, &toto] {
        let compliance = first.add_key(&backend, key.clone(), true, true)?;
        for violation in compliance.violations() {
            println!("warning: {violation}");
        }
    }
    let first = store.insert_release(first)?;
    println!("{}", first.summary(&backend, &list)?);

    let mut second = list.new_release(
        &backend,
        &mut store,
        Some(date(2020, 2, 1)),
        ReleaseSource::Current,
        InheritOptions {
            deactivate_invalid: true,
            ..config.inherit_options()
        },
    )?;
    second.deactivate(&toto)?;
    let _ = second.add_key(&backend, lola, true, false)?;
    let second = store.insert_release(second)?;
    println!("{}", second.summary(&backend, &list)?);

    let publication = second.publish(&backend, &store, &list, None, config.publish_options())?;
    println!("{}", publication.message);
    println!("{}", second.rule_list(&list));
    println!("exported bundle: {} bytes of base64", publication.keys.len());

    Ok(())
}
