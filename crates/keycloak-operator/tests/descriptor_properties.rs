use keycloak_operator::crds::{DatabaseSpec, DatabaseVendor};
use keycloak_operator::{KeycloakDescriptorBuilder, KeycloakOperatorSpec, INSTANCE_LABEL};
use keycloak_reconciler::{DescriptorBuilder, DesiredState, Identity};
use proptest::prelude::*;

fn vendor() -> impl Strategy<Value = DatabaseVendor> {
    prop_oneof![
        Just(DatabaseVendor::H2),
        Just(DatabaseVendor::Postgres),
        Just(DatabaseVendor::Mysql),
        Just(DatabaseVendor::Mariadb),
    ]
}

proptest! {
    #[test]
    fn credentials_are_never_inlined(
        admin in "[a-z][a-z0-9-]{0,20}[a-z0-9]",
        db_secret in "[a-z][a-z0-9-]{0,20}[a-z0-9]",
        replicas in 0i32..10,
        vendor in vendor(),
    ) {
        let spec = KeycloakOperatorSpec {
            admin_credentials_secret: admin.clone(),
            replicas,
            database: DatabaseSpec {
                vendor,
                address: Some("db.sso.svc".to_string()),
                database: Some("keycloak".to_string()),
                credentials_secret: Some(db_secret),
            },
            ..Default::default()
        };
        let desired = DesiredState::new(
            Identity::new("sso", "keycloak"),
            1,
            serde_json::to_value(&spec).unwrap(),
        );
        let descriptors = KeycloakDescriptorBuilder::default().build(&desired).unwrap();
        prop_assert_eq!(descriptors.len(), 4);

        for descriptor in &descriptors {
            prop_assert_eq!(&descriptor.body["metadata"]["labels"][INSTANCE_LABEL], "keycloak");
        }

        let env = descriptors[3].body["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .clone();
        for var in env {
            let name = var["name"].as_str().unwrap();
            if matches!(name, "KEYCLOAK_USER" | "KEYCLOAK_PASSWORD" | "DB_USER" | "DB_PASSWORD") {
                prop_assert!(var.get("value").is_none(), "{} carries a literal value", name);
                prop_assert!(var["valueFrom"]["secretKeyRef"]["name"].is_string());
            }
        }
        prop_assert_eq!(&descriptors[3].body["spec"]["replicas"], replicas);
    }
}
