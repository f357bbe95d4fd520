mod common;

use common::{token_for, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

async fn get_cart(app: &TestApp, user_id: Uuid) -> Value {
    let response = app
        .client
        .get(app.url(&format!("/users/{}/cart", user_id)))
        .bearer_auth(token_for(user_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(response.status().as_u16(), 200);
    response.json().await.expect("Failed to parse JSON")
}

#[tokio::test]
async fn new_user_gets_an_empty_cart_once() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();

    let first = get_cart(&app, user_id).await;
    let second = get_cart(&app, user_id).await;

    assert_eq!(first["id"], second["id"]);
    assert_eq!(first["user_id"], user_id.to_string());
    assert_eq!(first["items"].as_array().unwrap().len(), 0);
    assert_eq!(first["subtotal"], "0");
}

#[tokio::test]
async fn adding_a_product_twice_merges_quantities() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product = app.create_product("MERGE-1", "4.50").await;

    let first: Value = app
        .add_to_cart(user_id, &product["id"], 2)
        .await
        .json()
        .await
        .unwrap();
    let second: Value = app
        .add_to_cart(user_id, &product["id"], 3)
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["quantity"], 5);
    assert_eq!(second["unit_price"], "4.50");
    assert_eq!(second["line_total"], "22.50");

    let cart = get_cart(&app, user_id).await;
    assert_eq!(cart["items"].as_array().unwrap().len(), 1);
    assert_eq!(cart["subtotal"], "22.50");
}

#[tokio::test]
async fn update_and_remove_items() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product = app.create_product("UPD-1", "2.00").await;
    let item: Value = app
        .add_to_cart(user_id, &product["id"], 1)
        .await
        .json()
        .await
        .unwrap();
    let item_url = app.url(&format!(
        "/users/{}/cart/items/{}",
        user_id,
        item["id"].as_str().unwrap()
    ));

    let response = app
        .client
        .put(&item_url)
        .bearer_auth(token_for(user_id))
        .json(&json!({ "quantity": 7 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let updated: Value = response.json().await.unwrap();
    assert_eq!(updated["quantity"], 7);

    let response = app
        .client
        .put(&item_url)
        .bearer_auth(token_for(user_id))
        .json(&json!({ "quantity": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 422);

    for _ in 0..2 {
        let response = app
            .client
            .delete(&item_url)
            .bearer_auth(token_for(user_id))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 204);
    }

    let response = app
        .client
        .put(&item_url)
        .bearer_auth(token_for(user_id))
        .json(&json!({ "quantity": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn clear_cart_keeps_the_cart() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();
    let product = app.create_product("CLR-1", "1.00").await;
    app.add_to_cart(user_id, &product["id"], 3).await;
    let before = get_cart(&app, user_id).await;

    let response = app
        .client
        .delete(app.url(&format!("/users/{}/cart", user_id)))
        .bearer_auth(token_for(user_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let cleared: Value = response.json().await.unwrap();

    assert_eq!(cleared["id"], before["id"]);
    assert_eq!(cleared["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn unknown_product_cannot_be_added() {
    let app = TestApp::spawn().await;
    let user_id = Uuid::new_v4();

    let response = app
        .add_to_cart(user_id, &json!(Uuid::new_v4()), 1)
        .await;
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn carts_are_private() {
    let app = TestApp::spawn().await;
    let owner = Uuid::new_v4();
    let intruder = Uuid::new_v4();
    let product = app.create_product("PRIV-1", "1.00").await;
    let item: Value = app
        .add_to_cart(owner, &product["id"], 1)
        .await
        .json()
        .await
        .unwrap();

    let response = app
        .client
        .get(app.url(&format!("/users/{}/cart", owner)))
        .bearer_auth(token_for(intruder))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 403);

    // The intruder's own cart route cannot reach the owner's item.
    let response = app
        .client
        .put(app.url(&format!(
            "/users/{}/cart/items/{}",
            intruder,
            item["id"].as_str().unwrap()
        )))
        .bearer_auth(token_for(intruder))
        .json(&json!({ "quantity": 9 }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    let cart = get_cart(&app, owner).await;
    assert_eq!(cart["items"][0]["quantity"], 1);
}
