use kube::CustomResourceExt;

use stampede_proxy::loadtest::LoadTest;

fn main() {
    print!("{}", serde_yaml::to_string(&LoadTest::crd()).unwrap());
}
