fn main() {
    let supervisor = viper_init::spawn_all();
    supervisor.join_all();
}
