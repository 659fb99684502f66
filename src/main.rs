fn main() {
    trestle::run();
}
